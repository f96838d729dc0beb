//! Handler registry keyed by method, name and phase
//!
//! Functions answer requests whose name is not a feather. Triggers run
//! before or after the primitive operation on a feather and may rewrite the
//! record on its way in.

use super::{Datasource, Method, Request};
use crate::crud::CallContext;
use crate::error::Result;
use crate::store::Connection;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// When a trigger runs relative to the primitive operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Before,
    After,
}

/// What a trigger sees of the change in flight
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerEvent {
    pub method: Method,
    /// Feather the request was made on
    pub name: String,
    pub id: Option<String>,
    /// Persisted record before the change; `None` for POST
    pub old_rec: Option<Value>,
    /// Record as it will be (BEFORE) or was (AFTER) written. BEFORE triggers
    /// may modify it.
    pub new_rec: Value,
    /// Response of the primitive operation, AFTER only
    pub result: Option<Value>,
}

#[async_trait]
pub trait Function: Send + Sync {
    async fn call(
        &self,
        datasource: &Datasource,
        conn: &dyn Connection,
        ctx: &CallContext,
        request: &Request,
    ) -> Result<Value>;
}

#[async_trait]
pub trait Trigger: Send + Sync {
    async fn fire(
        &self,
        datasource: &Datasource,
        conn: &dyn Connection,
        ctx: &CallContext,
        event: &mut TriggerEvent,
    ) -> Result<()>;
}

/// Registered handler
#[derive(Clone)]
pub enum Handler {
    Function(Arc<dyn Function>),
    Trigger(Arc<dyn Trigger>),
}

/// Synchronous closure as a trigger
pub struct TriggerFn<F>(pub F);

#[async_trait]
impl<F> Trigger for TriggerFn<F>
where
    F: Fn(&mut TriggerEvent) -> Result<()> + Send + Sync,
{
    async fn fire(
        &self,
        _datasource: &Datasource,
        _conn: &dyn Connection,
        _ctx: &CallContext,
        event: &mut TriggerEvent,
    ) -> Result<()> {
        (self.0)(event)
    }
}

/// Synchronous closure as a function
pub struct FunctionFn<F>(pub F);

#[async_trait]
impl<F> Function for FunctionFn<F>
where
    F: Fn(&Request) -> Result<Value> + Send + Sync,
{
    async fn call(
        &self,
        _datasource: &Datasource,
        _conn: &dyn Connection,
        _ctx: &CallContext,
        request: &Request,
    ) -> Result<Value> {
        (self.0)(request)
    }
}

type Key = (Method, String, Option<Phase>);

#[derive(Default)]
pub struct Registry {
    handlers: DashMap<Key, Handler>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `function` under `method` and `name`, replacing any previous one
    pub fn register_function(&self, method: Method, name: &str, function: Arc<dyn Function>) {
        debug!(%method, name, "Registered function");
        self.handlers
            .insert((method, name.to_string(), None), Handler::Function(function));
    }

    /// Register `trigger` on feather `name` for `method` in `phase`
    pub fn register_trigger(
        &self,
        method: Method,
        name: &str,
        phase: Phase,
        trigger: Arc<dyn Trigger>,
    ) {
        debug!(%method, name, ?phase, "Registered trigger");
        self.handlers.insert(
            (method, name.to_string(), Some(phase)),
            Handler::Trigger(trigger),
        );
    }

    pub fn unregister(&self, method: Method, name: &str, phase: Option<Phase>) -> bool {
        self.handlers
            .remove(&(method, name.to_string(), phase))
            .is_some()
    }

    pub fn function(&self, method: Method, name: &str) -> Option<Arc<dyn Function>> {
        match self.handlers.get(&(method, name.to_string(), None))?.value() {
            Handler::Function(function) => Some(function.clone()),
            Handler::Trigger(_) => None,
        }
    }

    pub fn trigger(&self, method: Method, name: &str, phase: Phase) -> Option<Arc<dyn Trigger>> {
        match self
            .handlers
            .get(&(method, name.to_string(), Some(phase)))?
            .value()
        {
            Handler::Trigger(trigger) => Some(trigger.clone()),
            Handler::Function(_) => None,
        }
    }

    /// Triggers along `chain`, in chain order
    pub fn triggers(
        &self,
        method: Method,
        chain: &[String],
        phase: Phase,
    ) -> Vec<Arc<dyn Trigger>> {
        chain
            .iter()
            .filter_map(|name| self.trigger(method, name, phase))
            .collect()
    }
}
