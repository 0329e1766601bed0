//! Parent-set computation.
//!
//! A new request waits behind the still-pending most recent operation of
//! its target and of every ancestor up to the container root, plus the
//! pending request that makes its epoch visible. The set is bounded by the
//! depth of the object chain, not by history.

use tracing::debug;

use crate::container::{Identity, ObjectHandle};
use crate::error::{EngineError, EngineResult};
use crate::request::RequestKey;
use crate::runtime::{EpochRef, Runtime};
use crate::transport::Transport;

impl<T: Transport> Runtime<T> {
    /// Compute the parents of a request on `target` inside `epoch`.
    ///
    /// With `needs_identity`, any object on the chain whose remote identity
    /// is still pending is waited for here, outermost first, and the request
    /// that resolved it is kept as a parent. This is the one wait an
    /// asynchronous submission may perform.
    pub(crate) fn resolve(
        &mut self,
        target: ObjectHandle,
        epoch: Option<EpochRef>,
        needs_identity: bool,
    ) -> EngineResult<Vec<RequestKey>> {
        let mut parents = Vec::new();
        let mut unresolved = Vec::new();
        {
            let container = self.container(target.container)?;
            let mut cursor = Some(target.local);
            while let Some(local) = cursor {
                let record = container.record(local)?;
                if let Some(key) = record.last_op {
                    if self.arena.is_pending(key) {
                        parents.push(key);
                    }
                }
                if needs_identity {
                    match record.identity {
                        Identity::Pending(key) => unresolved.push((key, local)),
                        Identity::Failed => {
                            return Err(EngineError::UnresolvedIdentity(record.name.clone()))
                        }
                        Identity::Root | Identity::Known(_) => {}
                    }
                }
                cursor = record.parent;
            }
        }

        for (key, local) in unresolved.into_iter().rev() {
            let name = self.container(target.container)?.record(local)?.name.clone();
            debug!(object = %name, "waiting for identity");
            self.drive(key)?;
            let record = self.container(target.container)?.record(local)?;
            if record.identity.resolved().is_none() {
                return Err(EngineError::UnresolvedIdentity(name));
            }
            if self.arena.get(key).is_some() {
                parents.push(key);
            }
        }

        if let Some(anchor) = self.epoch_anchor(epoch)? {
            if self.arena.is_pending(anchor) {
                parents.push(anchor);
            }
        }

        let mut seen = Vec::with_capacity(parents.len());
        parents.retain(|key| {
            if seen.contains(key) {
                false
            } else {
                seen.push(*key);
                true
            }
        });
        Ok(parents)
    }
}
