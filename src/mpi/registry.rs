//! Per-host registry of live MPI worlds.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::messages::{Message, MpiHostsToRanksMessage, MpiMessage};
use crate::mpi::world::MpiWorld;
use crate::scheduler::Scheduler;
use crate::store::world_state_key;

/// All worlds with at least one rank on this host.
pub struct MpiWorldRegistry {
    scheduler: Arc<Scheduler>,
    worlds: Mutex<HashMap<i32, Arc<MpiWorld>>>,
}

impl MpiWorldRegistry {
    pub fn new(scheduler: Arc<Scheduler>) -> Arc<Self> {
        Arc::new(Self {
            scheduler,
            worlds: Mutex::new(HashMap::new()),
        })
    }

    /// Create a world as rank 0 and register it here.
    pub async fn create_world(
        &self,
        call: &Message,
        world_id: i32,
        size: i32,
    ) -> Result<Arc<MpiWorld>> {
        let world = MpiWorld::new(Arc::clone(&self.scheduler));
        world.create(call, world_id, size).await?;
        self.worlds.lock().await.insert(world_id, Arc::clone(&world));
        debug!(world_id, size, "created mpi world");
        Ok(world)
    }

    /// Fetch the local instance of a world, joining it from shared state
    /// on first contact.
    pub async fn get_or_initialise_world(&self, msg: &Message) -> Result<Arc<MpiWorld>> {
        let mut worlds = self.worlds.lock().await;
        if let Some(world) = worlds.get(&msg.mpi_world_id) {
            return Ok(Arc::clone(world));
        }

        let world = MpiWorld::new(Arc::clone(&self.scheduler));
        world.initialise_from_msg(msg, false).await?;
        worlds.insert(msg.mpi_world_id, Arc::clone(&world));
        debug!(world_id = msg.mpi_world_id, rank = msg.mpi_rank, "joined mpi world");
        Ok(world)
    }

    pub async fn get_world(&self, world_id: i32) -> Result<Arc<MpiWorld>> {
        self.worlds
            .lock()
            .await
            .get(&world_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("mpi world {world_id}")))
    }

    /// Hand an inbound message to its world.
    pub async fn route_message(&self, msg: MpiMessage) -> Result<()> {
        let world = self.get_world(msg.world_id).await?;
        world.handle_incoming(msg).await
    }

    /// Store a pushed rank→host table so joining ranks can read it.
    pub async fn apply_host_rank_table(&self, table: MpiHostsToRanksMessage) -> Result<()> {
        let key = world_state_key(table.world_id);
        let bytes = crate::messages::encode_message(&table);
        self.scheduler.store().set(&key, &bytes).await
    }

    /// Tear down one world. Idempotent.
    pub async fn destroy_world(&self, world_id: i32) {
        if let Some(world) = self.worlds.lock().await.remove(&world_id) {
            world.destroy().await;
        }
    }

    pub async fn clear(&self) {
        let mut worlds = self.worlds.lock().await;
        for (_, world) in worlds.drain() {
            world.destroy().await;
        }
    }
}
