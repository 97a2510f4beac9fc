//! Typed handle onto a shared value lane.

use super::observer::ChannelObserver;
use super::{attach_view, cast_or_unit, Attachment, Form, ValueEvent, ValueForm, ValueObserver};
use crate::coherence::{ValueOutlet, ValueSource};
use crate::config::DownlinkConfig;
use crate::context::DownlinkContext;
use crate::error::DownlinkError;
use crate::model::{
    DownlinkId, LinkKey, LinkModel, LinkState, ModelView, ValueChange, ValueDownlinkModel,
    ValueReplica,
};
use crate::value::Value;
use arc_swap::ArcSwap;
use futures::channel::mpsc;
use futures::Stream;
use std::sync::Arc;

struct ValueViewCore<F: Form> {
    id: DownlinkId,
    key: LinkKey,
    form: F,
    attachment: Attachment<ValueReplica>,
    observers: ArcSwap<Vec<Arc<dyn ValueObserver<F::Item>>>>,
}

impl<F: Form> ValueViewCore<F> {
    fn cast(&self, value: &Value) -> F::Item {
        cast_or_unit(&self.form, &self.key, value)
    }

    fn each(&self, notify: impl Fn(&dyn ValueObserver<F::Item>)) {
        for observer in self.observers.load_full().iter() {
            notify(observer.as_ref());
        }
    }
}

impl<F: Form> ModelView<ValueChange> for ValueViewCore<F> {
    fn id(&self) -> DownlinkId {
        self.id
    }

    fn did_link(&self) {
        self.each(|observer| observer.did_link());
    }

    fn did_sync(&self) {
        self.each(|observer| observer.did_sync());
    }

    fn will_change(&self, change: &ValueChange) {
        let new = self.cast(&change.new);
        self.each(|observer| observer.will_set(&new));
    }

    fn did_change(&self, change: &ValueChange) {
        let new = self.cast(&change.new);
        let old = self.cast(&change.old);
        self.each(|observer| observer.did_set(&new, &old));
    }

    fn did_unlink(&self) {
        self.each(|observer| observer.did_unlink());
    }

    fn did_connect(&self) {
        self.each(|observer| observer.did_connect());
    }

    fn did_disconnect(&self) {
        self.each(|observer| observer.did_disconnect());
    }

    fn did_fail(&self, error: &DownlinkError) {
        self.each(|observer| observer.did_fail(error));
    }

    fn did_detach(&self) {
        let (was_open, _) = self.attachment.release();
        if was_open {
            self.each(|observer| observer.did_close());
        }
    }
}

/// Typed handle onto a shared value lane.
///
/// Dropping the handle closes it.
pub struct ValueDownlink<F: Form = ValueForm> {
    context: Arc<dyn DownlinkContext>,
    config: DownlinkConfig,
    initial: Option<Value>,
    core: Arc<ValueViewCore<F>>,
}

impl<F: Form> ValueDownlink<F> {
    pub(crate) fn new(
        context: Arc<dyn DownlinkContext>,
        key: LinkKey,
        config: DownlinkConfig,
        initial: Option<Value>,
        form: F,
    ) -> Self {
        Self {
            context,
            config,
            initial,
            core: Arc::new(ValueViewCore {
                id: DownlinkId::new(),
                key,
                form,
                attachment: Attachment::new(),
                observers: ArcSwap::from_pointee(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> DownlinkId {
        self.core.id
    }

    pub fn key(&self) -> &LinkKey {
        &self.core.key
    }

    pub fn config(&self) -> &DownlinkConfig {
        &self.config
    }

    pub fn form(&self) -> &F {
        &self.core.form
    }

    pub fn is_open(&self) -> bool {
        self.core.attachment.is_open()
    }

    /// State of the underlying link, `None` when closed.
    pub fn link_state(&self) -> Option<LinkState> {
        self.model().ok().map(|model| model.link_state())
    }

    /// Attaches to the shared model for this key, creating it if needed.
    /// Opening an open handle does nothing.
    pub fn open(&self) -> Result<(), DownlinkError> {
        if self.is_open() {
            return Ok(());
        }
        let view: Arc<dyn ModelView<ValueChange>> = self.core.clone();
        let model = attach_view::<ValueReplica>(
            self.context.as_ref(),
            &self.core.key,
            &self.config,
            self.initial.clone(),
            view,
        )?;
        self.core.attachment.bind(&model);
        Ok(())
    }

    /// Detaches from the model. The replica is left untouched.
    pub fn close(&self) {
        let (was_open, model) = self.core.attachment.release();
        if let Some(model) = model {
            model.detach(self.core.id);
        }
        if was_open {
            self.core.each(|observer| observer.did_close());
        }
    }

    /// Tears the shared link down for every handle attached to it.
    pub fn unlink(&self) -> Result<(), DownlinkError> {
        let model: Arc<dyn LinkModel> = self.model()?;
        self.context.unlink_downlink(&model);
        Ok(())
    }

    /// Current value, or the form's unit value when closed or mistyped.
    pub fn get(&self) -> F::Item {
        match self.model() {
            Ok(model) => {
                let value = model.with_replica(|replica| replica.value().clone());
                self.core.cast(&value)
            }
            Err(_) => self.core.form.unit(),
        }
    }

    pub fn set(&self, item: F::Item) -> Result<(), DownlinkError> {
        let model = self.model()?;
        model.mutate(ValueChange::set(self.core.form.mold(&item)));
        Ok(())
    }

    pub fn observe(&self, observer: Arc<dyn ValueObserver<F::Item>>) {
        self.core.observers.rcu(|observers| {
            let mut next = Vec::clone(observers);
            next.push(observer.clone());
            next
        });
    }

    /// Stream of this handle's callbacks; it ends when the handle closes.
    pub fn changes(&self) -> impl Stream<Item = ValueEvent<F::Item>> {
        let (tx, rx) = mpsc::unbounded();
        self.observe(Arc::new(ChannelObserver::new(tx)));
        rx
    }

    /// Lazily recohered view of the replicated value, for derived state.
    pub fn outlet(&self) -> Result<Arc<ValueOutlet>, DownlinkError> {
        let source: Arc<dyn ValueSource> = self.model()?;
        Ok(ValueOutlet::new(source))
    }

    pub fn model(&self) -> Result<Arc<ValueDownlinkModel>, DownlinkError> {
        self.core.attachment.model()
    }
}

impl<F: Form> Drop for ValueDownlink<F> {
    fn drop(&mut self) {
        self.close();
    }
}
