//! Polling, blocking and cancellation.
//!
//! These, the identity wait in the resolver, and blocking submissions are
//! the only places the engine suspends. Observing a request terminal
//! through [`Runtime::test`], [`Runtime::wait`] or [`Runtime::cancel`]
//! releases the caller's reference and gives the schedule a chance to
//! sweep.

use std::mem;

use strata_protocol::Reply;
use tracing::{debug, warn};

use crate::container::{ContainerId, ObjectHandle};
use crate::error::{EngineError, EngineResult};
use crate::list::ListRole;
use crate::request::{
    Completion, Failure, RequestHandle, RequestKey, RequestState, RequestStatus,
};
use crate::runtime::Runtime;
use crate::transport::{CancelAck, Transport};

impl<T: Transport> Runtime<T> {
    /// Non-blocking poll. Returns the completion once the request is
    /// terminal.
    pub fn test(&mut self, handle: &mut RequestHandle) -> EngineResult<Option<Completion>> {
        if let Some(done) = &handle.done {
            return Ok(Some(done.clone()));
        }
        if !self.poll_request(handle.key)? {
            return Ok(None);
        }
        self.release_handle(handle).map(Some)
    }

    /// Block until the request is terminal.
    pub fn wait(&mut self, handle: &mut RequestHandle) -> EngineResult<Completion> {
        if let Some(done) = &handle.done {
            return Ok(done.clone());
        }
        self.drive(handle.key)?;
        self.release_handle(handle)
    }

    /// Block until every request in the container's list is terminal. The
    /// list is empty afterwards.
    pub fn wait_all(&mut self, container: ContainerId) -> EngineResult<()> {
        let keys = {
            let c = self.container(container)?;
            self.arena.keys(&c.list, ListRole::Container)
        };
        debug!(container = %self.container(container)?.name, outstanding = keys.len(), "waiting for all");
        for key in keys {
            self.drive(key)?;
        }
        let c = self.container(container)?;
        if !c.list.is_empty() {
            return Err(EngineError::misuse(format!(
                "container '{}' list not drained by wait_all",
                c.name
            )));
        }
        Ok(())
    }

    /// Block until every tracked request on `object` is terminal. Returns
    /// how many were waited for.
    pub fn wait_some(&mut self, container: ContainerId, object: ObjectHandle) -> EngineResult<usize> {
        let keys: Vec<RequestKey> = {
            let c = self.container(container)?;
            self.arena
                .keys(&c.list, ListRole::Container)
                .into_iter()
                .filter(|&key| {
                    self.arena
                        .get(key)
                        .is_some_and(|node| node.object == Some(object))
                })
                .collect()
        };
        for &key in &keys {
            self.drive(key)?;
        }
        Ok(keys.len())
    }

    /// Ask the transport to cancel the request.
    ///
    /// If the service had already run it, completion wins and the request
    /// ends with its real outcome. Calling this on a request whose terminal
    /// status was already observed returns that status unchanged.
    pub fn cancel(&mut self, handle: &mut RequestHandle) -> EngineResult<RequestStatus> {
        if let Some(done) = &handle.done {
            return Ok(done.status);
        }
        let node = self.arena.node(handle.key)?;
        if node.is_pending() {
            let seq = node.seq;
            let transport = node.transport.ok_or_else(|| {
                EngineError::misuse(format!("pending request {seq} has no transport handle"))
            })?;
            match self.transport.cancel(transport) {
                Ok(CancelAck::Cancelled) => {
                    debug!(seq = %seq, "request cancelled");
                    self.complete_request(handle.key, Err(Failure::Cancelled))?;
                }
                Ok(CancelAck::AlreadyCompleted) => {
                    debug!(seq = %seq, "cancel lost to completion");
                    self.drive(handle.key)?;
                }
                Err(e) => {
                    return Err(EngineError::Transport {
                        seq,
                        reason: e.to_string(),
                    })
                }
            }
        }
        Ok(self.release_handle(handle)?.status)
    }

    pub fn request_state(&self, handle: &RequestHandle) -> EngineResult<RequestState> {
        match &handle.done {
            Some(done) => Ok(done.state),
            None => Ok(self.arena.node(handle.key)?.state),
        }
    }

    pub fn request_status(&self, handle: &RequestHandle) -> EngineResult<RequestStatus> {
        match &handle.done {
            Some(done) => Ok(done.status),
            None => Ok(self.arena.node(handle.key)?.status),
        }
    }

    // ---------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------

    /// Poll once. Returns `true` if the request is terminal.
    pub(crate) fn poll_request(&mut self, key: RequestKey) -> EngineResult<bool> {
        let node = self.arena.node(key)?;
        if node.is_terminal() {
            return Ok(true);
        }
        let seq = node.seq;
        let transport = node.transport.ok_or_else(|| {
            EngineError::misuse(format!("pending request {seq} has no transport handle"))
        })?;
        let result = match self.transport.poll(transport) {
            Ok(None) => return Ok(false),
            Ok(Some(outcome)) => outcome.map_err(Failure::from_remote),
            Err(e) => {
                warn!(seq = %seq, error = %e, "transport poll failed");
                Err(Failure::TransportProgress(e.to_string()))
            }
        };
        self.complete_request(key, result)?;
        Ok(true)
    }

    /// Block until the request is terminal, without releasing anything.
    pub(crate) fn drive(&mut self, key: RequestKey) -> EngineResult<()> {
        loop {
            let node = self.arena.node(key)?;
            if node.is_terminal() {
                return Ok(());
            }
            let seq = node.seq;
            let transport = node.transport.ok_or_else(|| {
                EngineError::misuse(format!("pending request {seq} has no transport handle"))
            })?;
            let result = match self.transport.block(transport) {
                Ok(outcome) => outcome.map_err(Failure::from_remote),
                Err(e) => {
                    warn!(seq = %seq, error = %e, "transport wait failed");
                    Err(Failure::TransportProgress(e.to_string()))
                }
            };
            self.complete_request(key, result)?;
        }
    }

    /// Move a request to its terminal state.
    ///
    /// Verifies reply checksums, applies the completion hook, releases the
    /// transport handle, leaves the container list, clears the object's most
    /// recent operation pointer, and releases the parents it captured. The
    /// schedule keeps its reference until the next sweep.
    pub(crate) fn complete_request(
        &mut self,
        key: RequestKey,
        result: Result<Reply, Failure>,
    ) -> EngineResult<()> {
        let node = self.arena.node(key)?;
        if node.is_terminal() {
            return Ok(());
        }
        let (seq, kind, transport, hook, container, object) = (
            node.seq,
            node.kind,
            node.transport,
            node.hook,
            node.container,
            node.object,
        );

        let result = result.and_then(|reply| self.verify_reply(reply));
        if let Err(Failure::Integrity { reason }) = &result {
            warn!(seq = %seq, kind = %kind, reason = %reason, "integrity check failed");
        }
        self.apply_hook(hook, &result)?;

        let (state, status) = match &result {
            Ok(_) => (RequestState::Completed, RequestStatus::Succeeded),
            Err(Failure::Cancelled) => (RequestState::Cancelled, RequestStatus::Cancelled),
            Err(_) => (RequestState::Completed, RequestStatus::Failed),
        };
        let parents = {
            let node = self.arena.node_mut(key)?;
            node.state = state;
            node.status = status;
            node.transport = None;
            match result {
                Ok(reply) => node.reply = Some(reply),
                Err(failure) => node.failure = Some(failure),
            }
            mem::take(&mut node.parents)
        };
        if let Some(transport) = transport {
            self.transport.release(transport);
        }

        if let Some(c) = self.containers.get_mut(&container) {
            if self.arena.node(key)?.link(ListRole::Container).linked {
                self.arena.unlink(&mut c.list, ListRole::Container, key)?;
            }
            if let Some(object) = object {
                c.clear_last_op(&mut self.arena, object.local, key)?;
            }
        }
        for parent in parents {
            self.arena.decr_ref(parent)?;
        }
        debug!(seq = %seq, kind = %kind, status = ?status, "request completed");
        Ok(())
    }

    /// Drop the caller's reference to a terminal request and cache its
    /// completion in the handle.
    pub(crate) fn release_handle(&mut self, handle: &mut RequestHandle) -> EngineResult<Completion> {
        if let Some(done) = &handle.done {
            return Ok(done.clone());
        }
        let completion = self.arena.node(handle.key)?.completion();
        self.arena.decr_ref(handle.key)?;
        self.schedule.sweep(&mut self.arena)?;
        debug!(seq = %handle.seq, status = ?completion.status, "released request");
        handle.done = Some(completion.clone());
        Ok(completion)
    }
}
