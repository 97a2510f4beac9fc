//! Link state machine and view fan-out shared by value and map models.

use super::view::{DownlinkId, ModelView};
use super::{
    DownlinkKind, LinkEnv, LinkKey, LinkModel, LinkState, MapReplica, Replica, ValueReplica,
};
use crate::coherence::{Coherence, MapSource, Output, ValueSource, Version};
use crate::config::DownlinkConfig;
use crate::envelope::{Envelope, LinkRequest};
use crate::error::DownlinkError;
use crate::observability::{events, fields};
use crate::value::Value;
use arc_swap::ArcSwap;
use parking_lot::{Mutex, MutexGuard, ReentrantMutex};
use std::any::Any;
use std::cell::Cell;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, info, warn};

const COMPONENT: &str = "downlink_model";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Origin {
    Remote,
    Local,
}

struct ViewSlot<C> {
    view: Arc<dyn ModelView<C>>,
    /// False until an aliasing replay has caught the view up.
    live: AtomicBool,
}

struct ModelState<R: Replica> {
    replica: R,
    state: LinkState,
    started: bool,
    linked_received: bool,
    buffered: VecDeque<Value>,
    linked_deadline: Option<Instant>,
    unlink_deadline: Option<Instant>,
    /// Waiting for an `unlinked` ack that should end the model.
    closing: bool,
    /// A view attached while unlinking; re-sync instead of retiring.
    resync_on_unlinked: bool,
    retired: bool,
    deferred: VecDeque<R::Change>,
    recohere_scheduled: bool,
    coherence: Coherence,
}

impl<R: Replica> ModelState<R> {
    fn new(replica: R) -> Self {
        Self {
            replica,
            state: LinkState::Unlinked,
            started: false,
            linked_received: false,
            buffered: VecDeque::new(),
            linked_deadline: None,
            unlink_deadline: None,
            closing: false,
            resync_on_unlinked: false,
            retired: false,
            deferred: VecDeque::new(),
            recohere_scheduled: false,
            coherence: Coherence::new(),
        }
    }

    fn reset_link(&mut self) {
        self.linked_received = false;
        self.buffered.clear();
        self.linked_deadline = None;
        self.unlink_deadline = None;
    }
}

enum AfterUnlinked {
    Ignore,
    Retire,
    Relink(Option<Envelope>),
    Close,
}

/// The single shared replica of one lane.
///
/// Inbound envelopes and local mutations are applied one at a time; a
/// mutation issued from an observer callback while an envelope is being
/// dispatched is queued and applied once that dispatch completes.
/// Callers on other threads wait for the dispatch to finish.
pub struct DownlinkModel<R: Replica> {
    key: LinkKey,
    config: DownlinkConfig,
    env: LinkEnv,
    this: Weak<Self>,
    /// Held for every dispatch. The cell is set while a change is in flight.
    turn: ReentrantMutex<Cell<bool>>,
    state: Mutex<ModelState<R>>,
    views: ArcSwap<Vec<Arc<ViewSlot<R::Change>>>>,
}

impl<R: Replica> DownlinkModel<R> {
    pub fn new(
        key: LinkKey,
        config: DownlinkConfig,
        initial: Option<Value>,
        env: LinkEnv,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            key,
            config,
            env,
            this: this.clone(),
            turn: ReentrantMutex::new(Cell::new(false)),
            state: Mutex::new(ModelState::new(R::new(initial))),
            views: ArcSwap::from_pointee(Vec::new()),
        })
    }

    pub fn key(&self) -> &LinkKey {
        &self.key
    }

    pub fn config(&self) -> &DownlinkConfig {
        &self.config
    }

    pub fn link_state(&self) -> LinkState {
        self.state.lock().state
    }

    pub fn is_linked(&self) -> bool {
        self.state.lock().linked_received
    }

    pub fn view_count(&self) -> usize {
        self.views.load().len()
    }

    pub fn version(&self) -> Version {
        self.state.lock().coherence.version()
    }

    /// Reads the replica after running any pending recoherence.
    pub fn with_replica<T>(&self, read: impl FnOnce(&R) -> T) -> T {
        self.recohere();
        read(&self.state.lock().replica)
    }

    /// Attaches a view. Views joining a model that already linked are caught
    /// up on the next tick by replaying the current state to them alone.
    pub fn attach(&self, view: Arc<dyn ModelView<R::Change>>) {
        let id = view.id();
        if self.views.load().iter().any(|slot| slot.view.id() == id) {
            return;
        }

        let (replay, envelope) = {
            let mut st = self.state.lock();
            st.retired = false;
            let replay = st.linked_received || st.state == LinkState::Synced;
            let envelope = match st.state {
                LinkState::Unlinking => {
                    st.resync_on_unlinked = true;
                    None
                }
                LinkState::Unlinked if st.started => self.link_request(&mut st),
                _ => None,
            };
            (replay, envelope)
        };

        let slot = Arc::new(ViewSlot {
            view,
            live: AtomicBool::new(!replay),
        });
        self.views.rcu(|views| {
            let mut next = Vec::clone(views);
            next.push(slot.clone());
            next
        });

        debug!(
            event = events::VIEW_ATTACHED,
            component = COMPONENT,
            key = %fields::format_key(&self.key),
            view = %id,
            replay,
            "view attached"
        );

        if replay {
            self.defer(move |model| model.replay_view(id));
        }
        if let Some(envelope) = envelope {
            self.send(envelope);
        }
    }

    /// Detaches a view. Returns false if it was not attached.
    ///
    /// The last detach of a model that does not keep its link unlinks it.
    pub fn detach(&self, id: DownlinkId) -> bool {
        let mut removed = false;
        self.views.rcu(|views| {
            let mut next = Vec::clone(views);
            let before = next.len();
            next.retain(|slot| slot.view.id() != id);
            removed = next.len() != before;
            next
        });
        if !removed {
            return false;
        }

        debug!(
            event = events::VIEW_DETACHED,
            component = COMPONENT,
            key = %fields::format_key(&self.key),
            view = %id,
            "view detached"
        );

        if self.views.load().is_empty() && !self.config.keep_linked {
            let envelope = {
                let mut st = self.state.lock();
                self.unlink_request(&mut st)
            };
            if let Some(envelope) = envelope {
                self.send(envelope);
            }
        }
        true
    }

    /// Applies a local change and sends it as a `command`.
    pub fn mutate(&self, change: R::Change) {
        let turn = self.turn.lock();
        if turn.replace(true) {
            self.lock().deferred.push_back(change);
            return;
        }
        self.apply_change(change, Origin::Local);
        self.drain_deferred();
        turn.set(false);
    }

    /// Runs a pending recoherence now instead of on the next tick.
    pub fn recohere(&self) {
        let _turn = self.turn.lock();
        let work = {
            let mut st = self.state.lock();
            st.recohere_scheduled = false;
            let version = st.coherence.next_version();
            st.coherence
                .recohere(version)
                .map(|work| (version, work.outputs))
        };
        if let Some((version, outputs)) = work {
            for output in outputs {
                output.recohere_input(version);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, ModelState<R>> {
        self.state.lock()
    }

    fn defer<F>(&self, task: F)
    where
        F: FnOnce(&Self) + Send + 'static,
    {
        let this = self.this.clone();
        self.env.scheduler.defer(move || {
            if let Some(model) = this.upgrade() {
                task(&model);
            }
        });
    }

    fn is_connected(&self) -> bool {
        self.env
            .sink
            .upgrade()
            .is_some_and(|sink| sink.is_connected())
    }

    fn send(&self, envelope: Envelope) {
        match self.env.sink.upgrade() {
            Some(sink) => sink.push_envelope(envelope),
            None => debug!(
                event = events::SEND_FAILED,
                component = COMPONENT,
                key = %fields::format_key(&self.key),
                envelope = %fields::format_envelope(&envelope),
                "host connection is gone"
            ),
        }
    }

    fn live_views(&self) -> Vec<Arc<dyn ModelView<R::Change>>> {
        self.views
            .load()
            .iter()
            .filter(|slot| slot.live.load(Ordering::Acquire))
            .map(|slot| slot.view.clone())
            .collect()
    }

    fn take_views(&self) -> Vec<Arc<dyn ModelView<R::Change>>> {
        self.views
            .swap(Arc::new(Vec::new()))
            .iter()
            .map(|slot| slot.view.clone())
            .collect()
    }

    fn fan_out<W, D>(&self, will: W, did: D)
    where
        W: Fn(&dyn ModelView<R::Change>),
        D: Fn(&dyn ModelView<R::Change>),
    {
        let views = self.live_views();
        for view in &views {
            will(view.as_ref());
        }
        for view in &views {
            did(view.as_ref());
        }
    }

    fn link_request(&self, st: &mut ModelState<R>) -> Option<Envelope> {
        st.reset_link();
        st.state = LinkState::Unlinked;
        if !self.is_connected() {
            return None;
        }

        let mut request = LinkRequest::new(self.key.node(), self.key.lane());
        request.prio = self.config.priority;
        request.rate = self.config.rate;
        request.body = self.config.body.clone();

        let envelope = if self.config.keep_synced {
            st.state = LinkState::Syncing;
            st.replica.begin_sync();
            Envelope::Sync(request)
        } else {
            st.state = LinkState::Linking;
            Envelope::Link(request)
        };
        info!(
            event = events::LINK_REQUESTED,
            component = COMPONENT,
            key = %fields::format_key(&self.key),
            tag = envelope.tag(),
            "requesting link"
        );
        Some(envelope)
    }

    fn unlink_request(&self, st: &mut ModelState<R>) -> Option<Envelope> {
        st.resync_on_unlinked = false;
        match st.state {
            LinkState::Unlinked => {
                self.retire(st);
                None
            }
            LinkState::Unlinking => {
                st.closing = true;
                None
            }
            _ => {
                st.reset_link();
                st.state = LinkState::Unlinking;
                st.closing = true;
                st.unlink_deadline = Some(Instant::now() + self.env.unlink_timeout);
                info!(
                    event = events::UNLINK_REQUESTED,
                    component = COMPONENT,
                    key = %fields::format_key(&self.key),
                    "requesting unlink"
                );
                Some(Envelope::unlink(self.key.node(), self.key.lane()))
            }
        }
    }

    /// Marks the model for removal; the registry drops it on the next tick
    /// unless a view attaches first.
    fn retire(&self, st: &mut ModelState<R>) {
        if st.retired {
            return;
        }
        st.retired = true;
        st.closing = false;
        let sink = self.env.sink.clone();
        let key = self.key.clone();
        self.env.scheduler.defer(move || {
            if let Some(sink) = sink.upgrade() {
                sink.release(&key);
            }
        });
    }

    fn drain_deferred(&self) {
        loop {
            let next = self.lock().deferred.pop_front();
            match next {
                Some(change) => self.apply_change(change, Origin::Local),
                None => return,
            }
        }
    }

    fn apply_change(&self, change: R::Change, origin: Origin) {
        let change = self.lock().replica.prepare(change);
        let views = self.live_views();
        for view in &views {
            view.will_change(&change);
        }

        let command = {
            let mut st = self.lock();
            st.replica.apply(&change);
            match origin {
                Origin::Remote => None,
                Origin::Local if st.state.is_active() => Some(Envelope::command(
                    self.key.node(),
                    self.key.lane(),
                    R::command_body(&change),
                )),
                Origin::Local => {
                    debug!(
                        event = events::COMMAND_DROPPED,
                        component = COMPONENT,
                        key = %fields::format_key(&self.key),
                        state = ?st.state,
                        "applied local change without a link"
                    );
                    None
                }
            }
        };
        if let Some(command) = command {
            self.send(command);
        }

        for view in &views {
            view.did_change(&change);
        }
        self.decohere(&change);
    }

    fn decohere(&self, change: &R::Change) {
        let effects = R::effects(change);
        let (whole, keyed, schedule) = {
            let mut st = self.lock();
            let whole = if effects.is_empty() {
                st.coherence.decohere()
            } else {
                None
            };
            let keyed: Vec<_> = effects
                .into_iter()
                .filter_map(|(key, effect)| {
                    st.coherence
                        .decohere_key(&key, effect)
                        .map(|outputs| (key, effect, outputs))
                })
                .collect();
            let schedule = !std::mem::replace(&mut st.recohere_scheduled, true);
            (whole, keyed, schedule)
        };

        for output in whole.into_iter().flatten() {
            output.decohere_input();
        }
        for (key, effect, outputs) in keyed {
            for output in outputs {
                output.decohere_input_key(&key, effect);
            }
        }
        if schedule {
            self.defer(|model| model.recohere());
        }
    }

    fn replay_view(&self, id: DownlinkId) {
        let _turn = self.turn.lock();
        let views = self.views.load_full();
        let Some(slot) = views.iter().find(|slot| slot.view.id() == id).cloned() else {
            return;
        };
        if slot.live.load(Ordering::Acquire) {
            return;
        }

        let (linked, synced, changes) = {
            let st = self.lock();
            slot.live.store(true, Ordering::Release);
            (
                st.linked_received,
                st.state == LinkState::Synced,
                st.replica.replay(),
            )
        };

        let view = &slot.view;
        if linked {
            view.will_link();
            view.did_link();
        }
        for change in &changes {
            view.will_change(change);
            view.did_change(change);
        }
        if synced {
            view.will_sync();
            view.did_sync();
        }
    }

    fn handle_envelope(&self, envelope: Envelope) {
        match envelope {
            Envelope::Linked(_) => self.on_linked(),
            Envelope::Synced(_) => self.on_synced(),
            Envelope::Unlinked(_) => self.on_unlinked(),
            Envelope::Event(event) => self.on_event(event.body),
            other => debug!(
                event = events::ENVELOPE_UNROUTED,
                component = COMPONENT,
                key = %fields::format_key(&self.key),
                envelope = %fields::format_envelope(&other),
                "ignoring envelope a client never receives"
            ),
        }
    }

    fn on_linked(&self) {
        let buffered = {
            let mut st = self.lock();
            if st.linked_received || !st.state.is_active() {
                return;
            }
            st.linked_received = true;
            if st.state == LinkState::Linking {
                st.state = LinkState::Linked;
            }
            st.linked_deadline = None;
            std::mem::take(&mut st.buffered)
        };

        info!(
            event = events::LINK_ESTABLISHED,
            component = COMPONENT,
            key = %fields::format_key(&self.key),
            buffered = buffered.len(),
            "link established"
        );
        self.fan_out(|view| view.will_link(), |view| view.did_link());
        for body in buffered {
            self.on_event(body);
        }
    }

    fn on_synced(&self) {
        let needs_linked = {
            let st = self.lock();
            if st.state == LinkState::Synced || !st.state.is_active() {
                return;
            }
            !st.linked_received
        };
        if needs_linked {
            self.on_linked();
        }

        let removals = {
            let mut st = self.lock();
            if !st.state.is_active() {
                return;
            }
            st.state = LinkState::Synced;
            st.replica.end_sync()
        };
        for change in removals {
            self.apply_change(change, Origin::Remote);
        }

        info!(
            event = events::LINK_SYNCED,
            component = COMPONENT,
            key = %fields::format_key(&self.key),
            "link synced"
        );
        self.fan_out(|view| view.will_sync(), |view| view.did_sync());
    }

    fn on_event(&self, body: Value) {
        let decoded = {
            let mut st = self.lock();
            if !st.state.is_active() {
                debug!(
                    event = events::EVENT_DROPPED,
                    component = COMPONENT,
                    key = %fields::format_key(&self.key),
                    state = ?st.state,
                    "dropping event without a link"
                );
                return;
            }
            if !st.linked_received {
                if st.linked_deadline.is_none() {
                    st.linked_deadline = Some(Instant::now() + self.env.linked_timeout);
                }
                st.buffered.push_back(body);
                debug!(
                    event = events::EVENT_BUFFERED,
                    component = COMPONENT,
                    key = %fields::format_key(&self.key),
                    buffered = st.buffered.len(),
                    "buffering event received before linked"
                );
                return;
            }
            st.replica.decode_event(body)
        };

        match decoded {
            Ok(change) => self.apply_change(change, Origin::Remote),
            Err(reason) => LinkModel::fail(self, reason),
        }
    }

    fn on_unlinked(&self) {
        let next = {
            let mut st = self.lock();
            if st.state == LinkState::Unlinked {
                AfterUnlinked::Ignore
            } else {
                st.reset_link();
                st.state = LinkState::Unlinked;
                if st.resync_on_unlinked {
                    st.resync_on_unlinked = false;
                    st.closing = false;
                    AfterUnlinked::Relink(self.link_request(&mut st))
                } else if st.closing {
                    self.retire(&mut st);
                    AfterUnlinked::Retire
                } else if self.config.keep_linked {
                    AfterUnlinked::Relink(self.link_request(&mut st))
                } else {
                    self.retire(&mut st);
                    AfterUnlinked::Close
                }
            }
        };

        match next {
            AfterUnlinked::Ignore => {
                debug!(
                    event = events::LINK_UNLINKED,
                    component = COMPONENT,
                    key = %fields::format_key(&self.key),
                    "ignoring duplicate unlinked"
                );
            }
            AfterUnlinked::Retire => {
                info!(
                    event = events::LINK_UNLINKED,
                    component = COMPONENT,
                    key = %fields::format_key(&self.key),
                    "unlink acknowledged"
                );
            }
            AfterUnlinked::Relink(envelope) => {
                info!(
                    event = events::LINK_UNLINKED,
                    component = COMPONENT,
                    key = %fields::format_key(&self.key),
                    "link dropped, re-linking"
                );
                self.fan_out(|view| view.will_unlink(), |view| view.did_unlink());
                if let Some(envelope) = envelope {
                    self.send(envelope);
                }
            }
            AfterUnlinked::Close => {
                info!(
                    event = events::LINK_UNLINKED,
                    component = COMPONENT,
                    key = %fields::format_key(&self.key),
                    "link closed by host"
                );
                self.fan_out(|view| view.will_unlink(), |view| view.did_unlink());
                for view in self.take_views() {
                    view.did_detach();
                }
            }
        }
    }
}

impl<R: Replica> LinkModel for DownlinkModel<R> {
    fn key(&self) -> &LinkKey {
        &self.key
    }

    fn kind(&self) -> DownlinkKind {
        R::KIND
    }

    fn state(&self) -> LinkState {
        self.link_state()
    }

    fn start(&self) {
        let _turn = self.turn.lock();
        let envelope = {
            let mut st = self.lock();
            if st.started {
                return;
            }
            st.started = true;
            self.link_request(&mut st)
        };
        if let Some(envelope) = envelope {
            self.send(envelope);
        }
    }

    fn on_envelope(&self, envelope: Envelope) {
        let turn = self.turn.lock();
        let outermost = !turn.replace(true);
        self.handle_envelope(envelope);
        if outermost {
            self.drain_deferred();
            turn.set(false);
        }
    }

    fn fail(&self, reason: String) {
        let error = DownlinkError::ProtocolViolation {
            key: self.key.clone(),
            reason,
        };
        let _turn = self.turn.lock();
        warn!(
            event = events::PROTOCOL_VIOLATION,
            component = COMPONENT,
            key = %fields::format_key(&self.key),
            err = %error,
            "failing link"
        );

        let envelope = {
            let mut st = self.lock();
            self.unlink_request(&mut st)
        };
        let views = self.take_views();
        for view in &views {
            view.did_fail(&error);
        }
        for view in &views {
            view.did_detach();
        }
        if let Some(envelope) = envelope {
            self.send(envelope);
        }
    }

    fn unlink(&self) {
        let _turn = self.turn.lock();
        let envelope = {
            let mut st = self.lock();
            self.unlink_request(&mut st)
        };
        let views = self.take_views();
        for view in &views {
            view.will_unlink();
        }
        for view in &views {
            view.did_unlink();
        }
        for view in &views {
            view.did_detach();
        }
        if let Some(envelope) = envelope {
            self.send(envelope);
        }
    }

    fn did_connect(&self) {
        let _turn = self.turn.lock();
        let envelope = {
            let mut st = self.lock();
            if st.started && !st.retired && st.state == LinkState::Unlinked {
                self.link_request(&mut st)
            } else {
                None
            }
        };
        if let Some(envelope) = envelope {
            self.send(envelope);
        }
        for view in self.live_views() {
            view.did_connect();
        }
    }

    fn did_disconnect(&self) {
        let _turn = self.turn.lock();
        let (was_active, discard) = {
            let mut st = self.lock();
            let was_active = st.state.is_active();
            let was_closing = st.closing && !st.resync_on_unlinked;
            st.reset_link();
            st.state = LinkState::Unlinked;
            st.resync_on_unlinked = false;
            let discard = was_closing || !self.config.keep_linked;
            if discard {
                self.retire(&mut st);
            }
            st.closing = false;
            (was_active, discard)
        };

        for view in self.live_views() {
            view.did_disconnect();
        }
        if was_active {
            self.fan_out(|view| view.will_unlink(), |view| view.did_unlink());
        }
        if discard {
            for view in self.take_views() {
                view.did_detach();
            }
        }
    }

    fn poll_timeouts(&self, now: Instant) {
        let _turn = self.turn.lock();
        let (unlink_timed_out, relink, linked_timed_out) = {
            let mut st = self.lock();
            let mut relink = None;
            let unlink_timed_out = st.unlink_deadline.is_some_and(|deadline| now >= deadline);
            if unlink_timed_out {
                let resync = st.resync_on_unlinked;
                st.reset_link();
                st.state = LinkState::Unlinked;
                st.resync_on_unlinked = false;
                if resync {
                    st.closing = false;
                    relink = self.link_request(&mut st);
                } else {
                    self.retire(&mut st);
                }
            }
            let linked_timed_out = st.linked_deadline.is_some_and(|deadline| now >= deadline);
            (unlink_timed_out, relink, linked_timed_out)
        };

        if unlink_timed_out {
            warn!(
                event = events::UNLINK_TIMED_OUT,
                component = COMPONENT,
                key = %fields::format_key(&self.key),
                timeout_ms = self.env.unlink_timeout.as_millis() as u64,
                "no unlinked ack"
            );
        }
        if let Some(envelope) = relink {
            self.send(envelope);
        }
        if linked_timed_out {
            LinkModel::fail(
                self,
                format!(
                    "events buffered without linked for {:?}",
                    self.env.linked_timeout
                ),
            );
        }
    }

    fn view_count(&self) -> usize {
        DownlinkModel::view_count(self)
    }

    fn is_discardable(&self) -> bool {
        self.lock().retired && self.views.load().is_empty()
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl ValueSource for DownlinkModel<ValueReplica> {
    fn recohere_source(&self) {
        self.recohere();
    }

    fn source_value(&self) -> Value {
        self.lock().replica.value().clone()
    }

    fn source_version(&self) -> Version {
        self.version()
    }

    fn bind_output(&self, output: Weak<dyn Output>) {
        self.lock().coherence.bind_output(output);
    }
}

impl MapSource for DownlinkModel<MapReplica> {
    fn recohere_source(&self) {
        self.recohere();
    }

    fn source_entry(&self, key: &Value) -> Option<Value> {
        self.lock().replica.get(key).cloned()
    }

    fn source_snapshot(&self) -> BTreeMap<Value, Value> {
        self.lock().replica.entries().clone()
    }

    fn source_version(&self) -> Version {
        self.version()
    }

    fn bind_output(&self, output: Weak<dyn Output>) {
        self.lock().coherence.bind_output(output);
    }
}

#[cfg(test)]
mod tests {
    use super::DownlinkModel;
    use crate::config::DownlinkConfig;
    use crate::envelope::Envelope;
    use crate::error::DownlinkError;
    use crate::host::EnvelopeSink;
    use crate::model::{
        DownlinkId, LinkEnv, LinkKey, LinkModel, LinkState, MapChange, MapReplica, ModelView,
        ValueChange, ValueReplica,
    };
    use crate::scheduler::Scheduler;
    use crate::value::Value;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Weak};
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<Envelope>>,
        released: Mutex<Vec<LinkKey>>,
        offline: AtomicBool,
    }

    impl RecordingSink {
        fn tags(&self) -> Vec<&'static str> {
            self.sent.lock().iter().map(Envelope::tag).collect()
        }
    }

    impl EnvelopeSink for RecordingSink {
        fn push_envelope(&self, envelope: Envelope) {
            self.sent.lock().push(envelope);
        }

        fn is_connected(&self) -> bool {
            !self.offline.load(Ordering::SeqCst)
        }

        fn release(&self, key: &LinkKey) {
            self.released.lock().push(key.clone());
        }
    }

    struct RecordingView<C> {
        id: DownlinkId,
        log: Arc<Mutex<Vec<String>>>,
        label: &'static str,
        changes: Mutex<Vec<C>>,
    }

    impl<C> RecordingView<C> {
        fn new(label: &'static str, log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                id: DownlinkId::new(),
                log,
                label,
                changes: Mutex::new(Vec::new()),
            })
        }

        fn record(&self, what: &str) {
            self.log.lock().push(format!("{}:{what}", self.label));
        }
    }

    impl<C: Clone + Send + Sync> ModelView<C> for RecordingView<C> {
        fn id(&self) -> DownlinkId {
            self.id
        }

        fn did_link(&self) {
            self.record("did_link");
        }

        fn did_sync(&self) {
            self.record("did_sync");
        }

        fn will_change(&self, _change: &C) {
            self.record("will_change");
        }

        fn did_change(&self, change: &C) {
            self.record("did_change");
            self.changes.lock().push(change.clone());
        }

        fn did_unlink(&self) {
            self.record("did_unlink");
        }

        fn did_fail(&self, _error: &DownlinkError) {
            self.record("did_fail");
        }

        fn did_detach(&self) {
            self.record("did_detach");
        }
    }

    struct Fixture {
        sink: Arc<RecordingSink>,
        scheduler: Arc<Scheduler>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                sink: Arc::new(RecordingSink::default()),
                scheduler: Arc::new(Scheduler::new()),
            }
        }

        fn env(&self) -> LinkEnv {
            let sink: Arc<dyn EnvelopeSink> = self.sink.clone();
            let sink: Weak<dyn EnvelopeSink> = Arc::downgrade(&sink);
            LinkEnv {
                sink,
                scheduler: self.scheduler.clone(),
                linked_timeout: Duration::from_millis(50),
                unlink_timeout: Duration::from_millis(50),
            }
        }

        fn map_model(&self, config: DownlinkConfig) -> Arc<DownlinkModel<MapReplica>> {
            let key = LinkKey::new("warp://test", "/unit/a", "map").expect("valid key");
            DownlinkModel::new(key, config, None, self.env())
        }

        fn value_model(&self, config: DownlinkConfig) -> Arc<DownlinkModel<ValueReplica>> {
            let key = LinkKey::new("warp://test", "/unit/a", "value").expect("valid key");
            DownlinkModel::new(key, config, None, self.env())
        }
    }

    fn event(model: &DownlinkModel<MapReplica>, change: MapChange) {
        let key = model.key();
        model.on_envelope(Envelope::event(key.node(), key.lane(), change.to_body()));
    }

    fn transient() -> DownlinkConfig {
        DownlinkConfig {
            keep_linked: false,
            ..Default::default()
        }
    }

    #[test]
    fn will_callbacks_reach_every_view_before_any_did() {
        let fixture = Fixture::new();
        let model = fixture.map_model(DownlinkConfig::default());
        let log = Arc::new(Mutex::new(Vec::new()));
        model.attach(RecordingView::<MapChange>::new("a", log.clone()));
        model.attach(RecordingView::<MapChange>::new("b", log.clone()));
        model.start();
        model.on_envelope(Envelope::linked("/unit/a", "map"));
        log.lock().clear();

        event(&model, MapChange::update("k", 1));

        assert_eq!(
            *log.lock(),
            vec!["a:will_change", "b:will_change", "a:did_change", "b:did_change"]
        );
    }

    #[test]
    fn events_before_linked_are_buffered_in_order() {
        let fixture = Fixture::new();
        let model = fixture.map_model(DownlinkConfig::default());
        let log = Arc::new(Mutex::new(Vec::new()));
        let view = RecordingView::<MapChange>::new("a", log.clone());
        model.attach(view.clone());
        model.start();

        event(&model, MapChange::update("a", 1));
        event(&model, MapChange::update("b", 2));
        assert!(view.changes.lock().is_empty());

        model.on_envelope(Envelope::linked("/unit/a", "map"));

        let keys: Vec<_> = view
            .changes
            .lock()
            .iter()
            .filter_map(|change| match change {
                MapChange::Update { key, .. } => Some(key.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(keys, vec![Value::from("a"), Value::from("b")]);
        assert_eq!(log.lock().first().map(String::as_str), Some("a:did_link"));
    }

    #[test]
    fn buffered_events_fail_the_link_after_the_linked_timeout() {
        let fixture = Fixture::new();
        let model = fixture.map_model(DownlinkConfig::default());
        let log = Arc::new(Mutex::new(Vec::new()));
        model.attach(RecordingView::<MapChange>::new("a", log.clone()));
        model.start();
        event(&model, MapChange::update("a", 1));

        model.poll_timeouts(Instant::now() + Duration::from_secs(1));

        assert_eq!(*log.lock(), vec!["a:did_fail", "a:did_detach"]);
        assert_eq!(model.link_state(), LinkState::Unlinking);
        assert_eq!(fixture.sink.tags(), vec!["sync", "unlink"]);
    }

    #[test]
    fn out_of_order_bulk_load_is_a_protocol_violation() {
        let fixture = Fixture::new();
        let model = fixture.map_model(DownlinkConfig::default());
        let log = Arc::new(Mutex::new(Vec::new()));
        model.attach(RecordingView::<MapChange>::new("a", log.clone()));
        model.start();
        model.on_envelope(Envelope::linked("/unit/a", "map"));

        event(&model, MapChange::update("b", 1));
        event(&model, MapChange::update("a", 1));

        assert!(log.lock().contains(&"a:did_fail".to_string()));
        assert_eq!(model.view_count(), 0);
        assert_eq!(fixture.sink.tags(), vec!["sync", "unlink"]);
    }

    #[test]
    fn keep_synced_false_requests_a_bare_link() {
        let fixture = Fixture::new();
        let model = fixture.value_model(DownlinkConfig {
            keep_synced: false,
            ..Default::default()
        });
        model.start();
        assert_eq!(model.link_state(), LinkState::Linking);

        model.on_envelope(Envelope::linked("/unit/a", "value"));

        assert_eq!(model.link_state(), LinkState::Linked);
        assert_eq!(fixture.sink.tags(), vec!["link"]);
    }

    #[test]
    fn mutation_from_a_callback_is_applied_after_the_dispatch() {
        struct Echo {
            id: DownlinkId,
            model: Mutex<Weak<DownlinkModel<ValueReplica>>>,
            seen: Mutex<Vec<(&'static str, Value)>>,
        }

        impl ModelView<ValueChange> for Echo {
            fn id(&self) -> DownlinkId {
                self.id
            }

            fn will_change(&self, change: &ValueChange) {
                self.seen.lock().push(("will", change.new.clone()));
            }

            fn did_change(&self, change: &ValueChange) {
                self.seen.lock().push(("did", change.new.clone()));
                if change.new == Value::from(1) {
                    if let Some(model) = self.model.lock().upgrade() {
                        model.mutate(ValueChange::set(2));
                        self.seen.lock().push(("after_mutate", Value::Absent));
                    }
                }
            }
        }

        let fixture = Fixture::new();
        let model = fixture.value_model(DownlinkConfig::default());
        let echo = Arc::new(Echo {
            id: DownlinkId::new(),
            model: Mutex::new(Arc::downgrade(&model)),
            seen: Mutex::new(Vec::new()),
        });
        model.attach(echo.clone());
        model.start();
        model.on_envelope(Envelope::linked("/unit/a", "value"));

        model.on_envelope(Envelope::event("/unit/a", "value", 1));

        assert_eq!(
            *echo.seen.lock(),
            vec![
                ("will", Value::from(1)),
                ("did", Value::from(1)),
                ("after_mutate", Value::Absent),
                ("will", Value::from(2)),
                ("did", Value::from(2)),
            ]
        );
        assert_eq!(fixture.sink.tags(), vec!["sync", "command"]);
    }

    #[test]
    fn reattach_while_unlinking_resyncs_on_the_ack() {
        let fixture = Fixture::new();
        let model = fixture.value_model(transient());
        let log = Arc::new(Mutex::new(Vec::new()));
        let first = RecordingView::<ValueChange>::new("a", log.clone());
        model.attach(first.clone());
        model.start();
        model.on_envelope(Envelope::linked("/unit/a", "value"));
        model.on_envelope(Envelope::synced("/unit/a", "value"));

        model.detach(first.id);
        assert_eq!(model.link_state(), LinkState::Unlinking);
        model.attach(RecordingView::<ValueChange>::new("b", log.clone()));

        model.on_envelope(Envelope::unlinked("/unit/a", "value"));

        assert_eq!(model.link_state(), LinkState::Syncing);
        assert_eq!(fixture.sink.tags(), vec!["sync", "unlink", "sync"]);
        fixture.scheduler.run_pending();
        assert!(!model.is_discardable());
    }

    #[test]
    fn server_unlink_of_a_transient_model_detaches_views() {
        let fixture = Fixture::new();
        let model = fixture.value_model(transient());
        let log = Arc::new(Mutex::new(Vec::new()));
        model.attach(RecordingView::<ValueChange>::new("a", log.clone()));
        model.start();
        model.on_envelope(Envelope::linked("/unit/a", "value"));

        model.on_envelope(Envelope::unlinked("/unit/a", "value"));

        assert!(log.lock().ends_with(&["a:did_unlink".to_string(), "a:did_detach".to_string()]));
        assert!(model.is_discardable());
        fixture.scheduler.run_pending();
        assert_eq!(fixture.sink.released.lock().len(), 1);
    }

    #[test]
    fn unlink_timeout_retires_the_model() {
        let fixture = Fixture::new();
        let model = fixture.value_model(transient());
        let view = RecordingView::<ValueChange>::new("a", Arc::new(Mutex::new(Vec::new())));
        model.attach(view.clone());
        model.start();
        model.detach(view.id);

        model.poll_timeouts(Instant::now() + Duration::from_secs(1));

        assert_eq!(model.link_state(), LinkState::Unlinked);
        assert!(model.is_discardable());
    }

    #[test]
    fn offline_start_waits_for_connect() {
        let fixture = Fixture::new();
        fixture.sink.offline.store(true, Ordering::SeqCst);
        let model = fixture.map_model(DownlinkConfig::default());
        model.start();
        assert!(fixture.sink.tags().is_empty());

        fixture.sink.offline.store(false, Ordering::SeqCst);
        model.did_connect();

        assert_eq!(fixture.sink.tags(), vec!["sync"]);
        assert_eq!(model.link_state(), LinkState::Syncing);
    }
}
