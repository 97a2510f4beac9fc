/********************************************************************************
 * Copyright (c) 2024 Contributors to the Eclipse Foundation
 *
 * See the NOTICE file(s) distributed with this work for additional
 * information regarding copyright ownership.
 *
 * This program and the accompanying materials are made available under the
 * terms of the Apache License Version 2.0 which is available at
 * https://www.apache.org/licenses/LICENSE-2.0
 *
 * SPDX-License-Identifier: Apache-2.0
 ********************************************************************************/

//! Typed per-consumer handles onto shared downlink models.

mod builder;
mod form;
mod map_downlink;
mod observer;
mod value_downlink;

pub use builder::{MapDownlinkBuilder, ValueDownlinkBuilder};
pub use form::{BoolForm, FloatForm, Form, IntForm, JsonForm, TextForm, ValueForm};
pub use map_downlink::MapDownlink;
pub use observer::{MapEvent, MapObserver, ValueEvent, ValueObserver};
pub use value_downlink::ValueDownlink;

use crate::config::DownlinkConfig;
use crate::context::DownlinkContext;
use crate::error::DownlinkError;
use crate::model::{downcast_model, DownlinkModel, LinkKey, ModelView, Replica};
use crate::observability::events;
use crate::value::Value;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Open flag and weak model reference of one handle.
pub(crate) struct Attachment<R: Replica> {
    open: AtomicBool,
    model: Mutex<Weak<DownlinkModel<R>>>,
}

impl<R: Replica> Attachment<R> {
    pub(crate) fn new() -> Self {
        Self {
            open: AtomicBool::new(false),
            model: Mutex::new(Weak::new()),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) fn bind(&self, model: &Arc<DownlinkModel<R>>) {
        *self.model.lock() = Arc::downgrade(model);
        self.open.store(true, Ordering::Release);
    }

    pub(crate) fn model(&self) -> Result<Arc<DownlinkModel<R>>, DownlinkError> {
        if !self.is_open() {
            return Err(DownlinkError::NotOpen);
        }
        self.model.lock().upgrade().ok_or(DownlinkError::NotOpen)
    }

    /// Marks the handle closed. Returns whether it was open, and its model
    /// if that is still alive.
    pub(crate) fn release(&self) -> (bool, Option<Arc<DownlinkModel<R>>>) {
        let was_open = self.open.swap(false, Ordering::AcqRel);
        let model = std::mem::take(&mut *self.model.lock()).upgrade();
        (was_open, model)
    }
}

/// Finds the model for `key` or creates and registers one, then attaches
/// `view` to whichever model ends up owning the key.
pub(crate) fn attach_view<R: Replica>(
    context: &dyn DownlinkContext,
    key: &LinkKey,
    config: &DownlinkConfig,
    initial: Option<Value>,
    view: Arc<dyn ModelView<R::Change>>,
) -> Result<Arc<DownlinkModel<R>>, DownlinkError> {
    if let Some(existing) = context.get_downlink(key.host(), key.node(), key.lane()) {
        let model = downcast_model::<R>(existing)?;
        model.attach(view);
        return Ok(model);
    }

    let model = DownlinkModel::<R>::new(
        key.clone(),
        config.clone(),
        initial,
        context.link_env(key.host()),
    );
    model.attach(view.clone());
    let owner = context.open_downlink(model.clone());
    if Arc::as_ptr(&owner) as *const () == Arc::as_ptr(&model) as *const () {
        return Ok(model);
    }

    model.detach(view.id());
    let owner = downcast_model::<R>(owner)?;
    owner.attach(view);
    Ok(owner)
}

/// Casts through `form`, substituting its unit value on a mismatch.
pub(crate) fn cast_or_unit<F: Form>(form: &F, key: &LinkKey, value: &Value) -> F::Item {
    match form.cast(value) {
        Some(item) => item,
        None => {
            if value.is_defined() {
                debug!(
                    event = events::FORM_MISMATCH,
                    component = "downlink",
                    key = %key,
                    value = %value,
                    "value does not fit the handle's form"
                );
            }
            form.unit()
        }
    }
}
