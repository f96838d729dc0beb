//! Request dispatcher
//!
//! A [`Datasource`] turns a [`Request`] into engine calls:
//! - registered functions answer by name
//! - feather requests run BEFORE triggers, the primitive CRUD operation and
//!   AFTER triggers, walking the feather's ancestry most-derived first
//! - everything happens in one transaction unless the caller owns the
//!   connection

mod builtins;
pub mod receiver;
mod registry;
mod request;

pub use registry::{Function, FunctionFn, Handler, Phase, Registry, Trigger, TriggerEvent, TriggerFn};
pub use request::{Method, Request};

use crate::crud::{CallContext, Crud, UnlockCriteria};
use crate::error::{DataError, Result};
use crate::events::{unsubscribe, UnsubscribeBy};
use crate::feather::Feather;
use crate::store::{Connection, Store};
use crate::tools::patch;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Identity recorded for housekeeping done by the node itself
pub const SYSTEM_USER: &str = "system";

pub struct Datasource {
    store: Arc<dyn Store>,
    crud: Crud,
    registry: Registry,
    node_id: String,
}

impl Datasource {
    /// Datasource with the built-in functions registered
    pub fn new(store: Arc<dyn Store>, crud: Crud, node_id: impl Into<String>) -> Self {
        let registry = Registry::new();
        builtins::register(&registry);
        Self {
            store,
            crud,
            registry,
            node_id: node_id.into(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn crud(&self) -> &Crud {
        &self.crud
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    // ========================================================================
    // Entry points
    // ========================================================================

    /// Run `request` in its own transaction. Any error rolls the whole
    /// request back, cascades and trigger side effects included.
    pub async fn request(&self, request: Request) -> Result<Value> {
        let conn = self.store.begin().await?;
        let catalog_etag = self.crud.catalog().etag().await;
        let (method, name) = (request.method, request.name.clone());
        let result = match self.context(conn.as_ref(), &request).await {
            Ok(ctx) => self.dispatch(conn.as_ref(), &ctx, request).await,
            Err(e) => Err(e),
        };
        let result = match result {
            Ok(value) => conn.commit().await.map(|()| value),
            Err(e) => {
                debug!(%method, name = %name, error = %e, "Request failed, rolling back");
                if let Err(rollback) = conn.rollback().await {
                    warn!(error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        };
        drop(conn);
        // Feather changes reach the cache as they are made; undo them with the transaction
        if result.is_err() && self.crud.catalog().etag().await != catalog_etag {
            self.restore_catalog().await;
        }
        result
    }

    async fn restore_catalog(&self) {
        let restored: Result<()> = async {
            let conn = self.store.begin().await?;
            self.crud.catalog().reload(conn.as_ref()).await?;
            conn.commit().await
        }
        .await;
        match restored {
            Ok(()) => info!("Restored feather catalog after rollback"),
            Err(e) => warn!(error = %e, "Could not restore feather catalog"),
        }
    }

    /// Run `request` on a connection the caller owns; nothing is committed
    pub async fn request_with(&self, conn: &dyn Connection, request: Request) -> Result<Value> {
        let ctx = self.context(conn, &request).await?.nested();
        self.dispatch(conn, &ctx, request).await
    }

    /// Run `request` from inside a handler, as the handler's caller
    pub async fn nested(
        &self,
        conn: &dyn Connection,
        ctx: &CallContext,
        request: Request,
    ) -> Result<Value> {
        self.dispatch(conn, &ctx.nested(), request).await
    }

    /// Drop the subscriptions and locks of a client session that went away
    pub async fn release_session(&self, session_id: &str) -> Result<()> {
        self.release(UnsubscribeBy::Instance, session_id, UnlockCriteria::session(session_id))
            .await
    }

    /// Drop whatever a previous run of this node left behind
    pub async fn reset_node(&self) -> Result<()> {
        self.release(
            UnsubscribeBy::Node,
            &self.node_id,
            UnlockCriteria::node(self.node_id.as_str()),
        )
        .await
    }

    async fn release(&self, by: UnsubscribeBy, key: &str, criteria: UnlockCriteria) -> Result<()> {
        let conn = self.store.begin().await?;
        let ctx = CallContext::new(SYSTEM_USER)
            .node(self.node_id.as_str())
            .bypassed();
        let unsubscribed = unsubscribe(conn.as_ref(), key, by).await?;
        let unlocked = self.crud.unlock(conn.as_ref(), &ctx, &criteria).await?;
        conn.commit().await?;
        info!(key, by = ?by, unsubscribed, unlocked, "Released subscriptions and locks");
        Ok(())
    }

    async fn context(&self, conn: &dyn Connection, request: &Request) -> Result<CallContext> {
        if request.user.trim().is_empty() {
            return Err(DataError::unauthorized("Request requires a user"));
        }
        self.crud.catalog().refresh(conn).await?;
        let is_super_user = self
            .crud
            .authorizer()
            .is_super_user(conn, &request.user)
            .await?;
        let mut ctx = CallContext::new(request.user.as_str())
            .node(self.node_id.as_str())
            .super_user(is_super_user);
        if let Some(session) = &request.session_id {
            ctx = ctx.session(session.as_str());
        }
        Ok(ctx)
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    async fn dispatch(
        &self,
        conn: &dyn Connection,
        ctx: &CallContext,
        mut request: Request,
    ) -> Result<Value> {
        if let Some(subscription) = request.subscription.as_mut() {
            if subscription.node_id.is_empty() {
                subscription.node_id = self.node_id.clone();
            }
            if subscription.event_key.is_empty() {
                if let Some(session) = &ctx.session_id {
                    subscription.event_key = session.clone();
                }
            }
        }
        debug!(
            method = %request.method,
            name = %request.name,
            id = ?request.id,
            user = %ctx.user,
            "Dispatching request"
        );

        if let Some(function) = self.registry.function(request.method, &request.name) {
            return function.call(self, conn, ctx, &request).await;
        }
        let feather = self.crud.catalog().resolve(&request.name).ok_or_else(|| {
            DataError::not_found(format!(
                "Function or feather \"{}\" not found",
                request.name
            ))
        })?;
        request.name = feather.name.clone();

        match request.method {
            Method::Get => {
                if request.id.is_none() && feather.plural.is_none() && !ctx.is_super_user {
                    return Err(DataError::validation(format!(
                        "Feather \"{}\" has no plural and can not be listed",
                        feather.name
                    )));
                }
                self.crud
                    .select(
                        conn,
                        ctx,
                        &feather.name,
                        request.id.as_deref(),
                        &request.query(),
                    )
                    .await
            }
            Method::Post => {
                let request = self.upsert(conn, &feather, request).await?;
                self.write(conn, ctx, &feather, request).await
            }
            Method::Patch | Method::Delete => {
                if request.id.is_none() {
                    return Err(DataError::validation(format!(
                        "{} on \"{}\" requires an id",
                        request.method, feather.name
                    )));
                }
                self.write(conn, ctx, &feather, request).await
            }
        }
    }

    /// A POST naming a live record becomes a PATCH: properties the payload
    /// omits keep their stored values.
    async fn upsert(&self, conn: &dyn Connection, feather: &Feather, request: Request) -> Result<Request> {
        let Some(id) = request
            .data
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
        else {
            return Ok(request);
        };
        let Some(old) = self.crud.fetch(conn, &feather.name, &id).await? else {
            return Ok(request);
        };
        if old.get("isDeleted") == Some(&Value::Bool(true)) {
            return Ok(request);
        }

        let mut merged = old.clone();
        if let (Value::Object(stored), Value::Object(given)) = (&mut merged, &request.data) {
            for (key, value) in given {
                stored.insert(key.clone(), value.clone());
            }
        }
        debug!(feather = %feather.name, id = %id, "Upserting existing record");
        let mut request = request;
        request.method = Method::Patch;
        request.data = patch::to_value(&patch::diff(&old, &merged));
        request.id = Some(id);
        Ok(request)
    }

    /// POST, PATCH or DELETE wrapped in the trigger walks
    async fn write(
        &self,
        conn: &dyn Connection,
        ctx: &CallContext,
        feather: &Feather,
        mut request: Request,
    ) -> Result<Value> {
        let chain = self.crud.catalog().ancestry(&feather.name);
        let before = self.registry.triggers(request.method, &chain, Phase::Before);
        let after = self.registry.triggers(request.method, &chain, Phase::After);
        if before.is_empty() && after.is_empty() {
            return self.primitive(conn, ctx, feather, &request).await;
        }

        let old_rec = match (request.method, request.id.as_deref()) {
            (Method::Post, _) | (_, None) => None,
            (_, Some(id)) => Some(self.crud.fetch(conn, &feather.name, id).await?.ok_or_else(
                || DataError::not_found(format!("Record \"{}\" of \"{}\" not found", id, feather.name)),
            )?),
        };
        let new_rec = match (&old_rec, request.method) {
            (Some(old), Method::Patch) => patch::apply(old.clone(), &patch::parse(&request.data)?)?,
            (Some(old), _) => old.clone(),
            (None, _) => request.data.clone(),
        };
        let mut event = TriggerEvent {
            method: request.method,
            name: feather.name.clone(),
            id: request.id.clone(),
            old_rec,
            new_rec,
            result: None,
        };

        for trigger in &before {
            trigger.fire(self, conn, ctx, &mut event).await?;
        }
        if !before.is_empty() {
            match (&event.old_rec, request.method) {
                (None, Method::Post) => request.data = event.new_rec.clone(),
                (Some(old), Method::Patch) => {
                    if event.new_rec.get("objectType") != old.get("objectType") {
                        return Err(DataError::validation(format!(
                            "Can not change the type of record \"{}\"",
                            event.id.as_deref().unwrap_or_default()
                        )));
                    }
                    request.data = patch::to_value(&patch::diff(old, &event.new_rec));
                }
                _ => {}
            }
        }

        let result = self.primitive(conn, ctx, feather, &request).await?;
        if after.is_empty() {
            return Ok(result);
        }

        let persisted = match (&event.old_rec, request.method) {
            (None, _) => patch::apply(request.data.clone(), &patch::parse(&result)?)?,
            (Some(old), Method::Patch) => {
                let intended = patch::apply(old.clone(), &patch::parse(&request.data)?)?;
                patch::apply(intended, &patch::parse(&result)?)?
            }
            (Some(old), _) => match event.id.as_deref() {
                Some(id) => self
                    .crud
                    .fetch(conn, &feather.name, id)
                    .await?
                    .unwrap_or_else(|| old.clone()),
                None => old.clone(),
            },
        };
        if event.id.is_none() {
            event.id = persisted
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string);
        }
        event.new_rec = persisted;
        event.result = Some(result.clone());
        for trigger in &after {
            trigger.fire(self, conn, ctx, &mut event).await?;
        }
        Ok(event.result.unwrap_or(result))
    }

    async fn primitive(
        &self,
        conn: &dyn Connection,
        ctx: &CallContext,
        feather: &Feather,
        request: &Request,
    ) -> Result<Value> {
        let id = || {
            request.id.as_deref().ok_or_else(|| {
                DataError::validation(format!(
                    "{} on \"{}\" requires an id",
                    request.method, feather.name
                ))
            })
        };
        match request.method {
            Method::Get => {
                self.crud
                    .select(conn, ctx, &feather.name, request.id.as_deref(), &request.query())
                    .await
            }
            Method::Post => {
                self.crud
                    .insert(conn, ctx, &feather.name, request.data.clone())
                    .await
            }
            Method::Patch => {
                let ops = patch::parse(&request.data)?;
                self.crud
                    .update(conn, ctx, &feather.name, id()?, &ops)
                    .await
            }
            Method::Delete => self
                .crud
                .delete(conn, ctx, &feather.name, id()?, request.is_hard)
                .await
                .map(Value::Bool),
        }
    }
}
