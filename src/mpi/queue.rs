//! In-memory MPI message queue.
//!
//! One queue per `(sender, destination)` rank pair on the destination's
//! host. Pops match on message type and datatype without consuming on
//! mismatch, so collective traffic cannot be swallowed by a stray NORMAL
//! receive.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::messages::{MpiDatatype, MpiMessage, MpiMessageType};

#[derive(Default)]
pub struct MpiQueue {
    inner: Mutex<VecDeque<MpiMessage>>,
    notify: Notify,
}

impl MpiQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, msg: MpiMessage) {
        self.inner.lock().unwrap().push_back(msg);
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pop the head message once one is available.
    ///
    /// The head must match `expected_type` (and `expected_datatype` when
    /// given); otherwise this fails with `TypeMismatch` and the message
    /// stays queued.
    pub async fn pop(
        &self,
        expected_type: MpiMessageType,
        expected_datatype: Option<MpiDatatype>,
    ) -> Result<MpiMessage> {
        loop {
            // Arm the notification before checking, so a push that lands
            // between the check and the wait still wakes us.
            let notified = self.notify.notified();
            {
                let mut queue = self.inner.lock().unwrap();
                if let Some(head) = queue.front() {
                    if head.message_type() != expected_type {
                        return Err(Error::TypeMismatch {
                            expected: format!("{expected_type:?}"),
                            found: format!("{:?}", head.message_type()),
                        });
                    }
                    if let Some(datatype) = expected_datatype {
                        if head.datatype() != datatype {
                            return Err(Error::TypeMismatch {
                                expected: format!("{datatype:?}"),
                                found: format!("{:?}", head.datatype()),
                            });
                        }
                    }
                    return Ok(queue.pop_front().expect("head just observed"));
                }
            }
            notified.await;
        }
    }

    /// Wait for a head message and return a copy without consuming it.
    pub async fn peek(&self) -> MpiMessage {
        loop {
            let notified = self.notify.notified();
            {
                let queue = self.inner.lock().unwrap();
                if let Some(head) = queue.front() {
                    return head.clone();
                }
            }
            notified.await;
        }
    }
}
