//! Functions every datasource answers

use super::{Datasource, Function, Method, Registry, Request};
use crate::auth::Target;
use crate::crud::{CallContext, UnlockCriteria};
use crate::error::{DataError, Result};
use crate::events::{subscribe, unsubscribe, SubscriptionRequest, UnsubscribeBy};
use crate::feather::{Feather, Grant};
use crate::store::Connection;
use crate::tools::Action;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

const BUILTINS: &[(Method, &str)] = &[
    (Method::Post, "lock"),
    (Method::Post, "unlock"),
    (Method::Post, "subscribe"),
    (Method::Post, "unsubscribe"),
    (Method::Get, "getFeather"),
    (Method::Post, "getFeather"),
    (Method::Post, "saveFeather"),
    (Method::Post, "deleteFeather"),
    (Method::Post, "saveAuthorization"),
    (Method::Get, "isAuthorized"),
    (Method::Post, "isAuthorized"),
    (Method::Post, "grantRole"),
];

pub(super) fn register(registry: &Registry) {
    for (method, name) in BUILTINS {
        registry.register_function(*method, name, Arc::new(Builtin(*name)));
    }
}

/// Arguments of a built-in function, taken from `data`
fn args<T: DeserializeOwned>(request: &Request) -> Result<T> {
    let data = match &request.data {
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    };
    serde_json::from_value(data).map_err(|e| {
        DataError::validation(format!("Invalid arguments for \"{}\": {}", request.name, e))
    })
}

fn require_super(ctx: &CallContext, what: &str) -> Result<()> {
    if !ctx.is_super_user {
        return Err(DataError::unauthorized(format!(
            "Only a super user may {}",
            what
        )));
    }
    Ok(())
}

#[derive(Deserialize)]
struct IdArgs {
    id: String,
}

#[derive(Deserialize)]
struct SubscribeArgs {
    subscription: SubscriptionRequest,
    #[serde(default)]
    ids: Vec<String>,
    #[serde(default)]
    id: Option<String>,
}

#[derive(Deserialize)]
struct UnsubscribeArgs {
    id: String,
    #[serde(default, rename = "type")]
    by: UnsubscribeBy,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetFeatherArgs {
    name: String,
    #[serde(default = "yes")]
    include_inherited: bool,
}

fn yes() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(item) => vec![item],
            OneOrMany::Many(items) => items,
        }
    }
}

#[derive(Deserialize)]
struct SaveFeatherArgs {
    specs: OneOrMany<Feather>,
}

#[derive(Deserialize)]
struct DeleteFeatherArgs {
    name: OneOrMany<String>,
}

#[derive(Deserialize)]
struct SaveAuthorizationArgs {
    id: String,
    role: String,
    actions: Grant,
}

#[derive(Deserialize)]
struct IsAuthorizedArgs {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    feather: Option<String>,
    action: String,
    #[serde(default)]
    user: Option<String>,
}

#[derive(Deserialize)]
struct GrantRoleArgs {
    role: String,
    member: String,
}

/// Built-in function, dispatched by name
struct Builtin(&'static str);

#[async_trait]
impl Function for Builtin {
    async fn call(
        &self,
        ds: &Datasource,
        conn: &dyn Connection,
        ctx: &CallContext,
        request: &Request,
    ) -> Result<Value> {
        match self.0 {
            // Locks
            "lock" => {
                let IdArgs { id } = args(request)?;
                Ok(Value::Bool(ds.crud().lock(conn, ctx, &id).await?))
            }
            "unlock" => {
                let criteria: UnlockCriteria = args(request)?;
                Ok(Value::from(ds.crud().unlock(conn, ctx, &criteria).await?))
            }

            // Subscriptions
            "subscribe" => {
                let SubscribeArgs {
                    mut subscription,
                    mut ids,
                    id,
                } = args(request)?;
                ids.extend(id);
                if subscription.node_id.is_empty() {
                    subscription.node_id = ds.node_id().to_string();
                }
                if subscription.event_key.is_empty() {
                    subscription.event_key = ctx.session_id.clone().unwrap_or_default();
                }
                subscribe(conn, &subscription, &ids).await?;
                Ok(Value::Bool(true))
            }
            "unsubscribe" => {
                let UnsubscribeArgs { id, by } = args(request)?;
                if by == UnsubscribeBy::Node {
                    require_super(ctx, "unsubscribe a node")?;
                }
                Ok(Value::from(unsubscribe(conn, &id, by).await?))
            }

            // Catalog
            "getFeather" => {
                let GetFeatherArgs {
                    name,
                    include_inherited,
                } = args(request)?;
                match ds.crud().catalog().get_feather(&name, include_inherited) {
                    Some(feather) => Ok(serde_json::to_value(feather)?),
                    None => Ok(Value::Null),
                }
            }
            "saveFeather" => {
                require_super(ctx, "change feathers")?;
                let SaveFeatherArgs { specs } = args(request)?;
                for feather in specs.into_vec() {
                    ds.crud().catalog().save_feather(conn, feather).await?;
                }
                Ok(Value::Bool(true))
            }
            "deleteFeather" => {
                require_super(ctx, "delete feathers")?;
                let DeleteFeatherArgs { name } = args(request)?;
                for name in name.into_vec() {
                    ds.crud().catalog().delete_feather(conn, &name).await?;
                }
                Ok(Value::Bool(true))
            }

            // Authorization
            "saveAuthorization" => {
                let SaveAuthorizationArgs { id, role, actions } = args(request)?;
                ds.crud()
                    .authorizer()
                    .save_authorization(conn, &ctx.user, &id, &role, &actions)
                    .await?;
                Ok(Value::Bool(true))
            }
            "isAuthorized" => {
                let IsAuthorizedArgs {
                    id,
                    feather,
                    action,
                    user,
                } = args(request)?;
                let action = Action::parse(&action)
                    .ok_or_else(|| DataError::validation(format!("Unknown action \"{}\"", action)))?;
                let user = match user {
                    Some(user) if user != ctx.user => {
                        require_super(ctx, "check another user's authorization")?;
                        user
                    }
                    _ => ctx.user.clone(),
                };
                let authorizer = ds.crud().authorizer();
                let allowed = match (id, feather) {
                    (Some(id), _) => {
                        let Some(feather) = authorizer.record_feather(conn, &id).await? else {
                            return Ok(Value::Bool(false));
                        };
                        authorizer
                            .is_authorized(conn, &user, Target::Record { id: &id, feather: &feather }, action)
                            .await?
                    }
                    (None, Some(feather)) => {
                        authorizer
                            .is_authorized(conn, &user, Target::Feather(&feather), action)
                            .await?
                    }
                    (None, None) => {
                        return Err(DataError::validation(
                            "isAuthorized requires an id or a feather",
                        ))
                    }
                };
                Ok(Value::Bool(allowed))
            }
            "grantRole" => {
                let GrantRoleArgs { role, member } = args(request)?;
                ds.crud()
                    .authorizer()
                    .grant_role(conn, &ctx.user, &role, &member)
                    .await?;
                Ok(Value::Bool(true))
            }

            other => Err(DataError::not_found(format!(
                "Function \"{}\" not found",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::datasource::{Method, Request};
    use crate::error::DataError;
    use crate::test_helpers::{contact_feather, datasource};
    use serde_json::{json, Value};

    fn save_contact() -> Request {
        Request::post(
            "saveFeather",
            "admin",
            json!({ "specs": serde_json::to_value(contact_feather()).unwrap() }),
        )
    }

    #[tokio::test]
    async fn test_feather_functions() {
        let (_store, ds) = datasource().await;
        let err = ds
            .request(Request::post("saveFeather", "bob", save_contact().data))
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::Unauthorized(_)));

        assert_eq!(ds.request(save_contact()).await.unwrap(), Value::Bool(true));
        let feather = ds
            .request(Request::get("getFeather", "bob").data(json!({"name": "Contact"})))
            .await
            .unwrap();
        assert_eq!(feather["name"], "Contact");
        assert!(feather["properties"]["firstName"].is_object());
        assert!(feather["properties"]["created"].is_object());

        let own = ds
            .request(
                Request::get("getFeather", "bob")
                    .data(json!({"name": "Contact", "includeInherited": false})),
            )
            .await
            .unwrap();
        assert!(own["properties"].get("created").is_none());

        ds.request(Request::post(
            "deleteFeather",
            "admin",
            json!({"name": "Contact"}),
        ))
        .await
        .unwrap();
        let gone = ds
            .request(Request::get("getFeather", "bob").data(json!({"name": "Contact"})))
            .await
            .unwrap();
        assert_eq!(gone, Value::Null);
    }

    #[tokio::test]
    async fn test_lock_and_unlock_functions() {
        let (_store, ds) = datasource().await;
        ds.request(save_contact()).await.unwrap();
        ds.request(Request::post("Contact", "ann", json!({"id": "c1"})))
            .await
            .unwrap();

        let err = ds
            .request(Request::post("lock", "ann", json!({"id": "c1"})))
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::Validation(_)));
        let locked = ds
            .request(Request::post("lock", "ann", json!({"id": "c1"})).session("s1"))
            .await
            .unwrap();
        assert_eq!(locked, Value::Bool(true));

        let err = ds
            .request(
                Request::patch(
                    "Contact",
                    "bob",
                    "c1",
                    json!([{"op": "replace", "path": "/firstName", "value": "X"}]),
                )
                .session("s2"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::Conflict(_)));

        let released = ds
            .request(Request::post("unlock", "ann", json!({"sessionId": "s1"})))
            .await
            .unwrap();
        assert_eq!(released, json!(1));
    }

    #[tokio::test]
    async fn test_authorization_functions() {
        let (_store, ds) = datasource().await;
        ds.request(save_contact()).await.unwrap();

        let allowed = ds
            .request(Request::get("isAuthorized", "bob").data(json!({
                "feather": "Contact",
                "action": "canUpdate"
            })))
            .await
            .unwrap();
        assert_eq!(allowed, Value::Bool(true));

        ds.request(Request::post(
            "saveAuthorization",
            "admin",
            json!({"id": "Contact", "role": "everyone", "actions": {"canRead": true, "canUpdate": false}}),
        ))
        .await
        .unwrap();
        let allowed = ds
            .request(Request::get("isAuthorized", "bob").data(json!({
                "feather": "Contact",
                "action": "canUpdate"
            })))
            .await
            .unwrap();
        assert_eq!(allowed, Value::Bool(false));

        let err = ds
            .request(Request::post(
                "grantRole",
                "bob",
                json!({"role": "administrator", "member": "bob"}),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::Unauthorized(_)));
        ds.request(Request::post(
            "grantRole",
            "admin",
            json!({"role": "administrator", "member": "bob"}),
        ))
        .await
        .unwrap();
        let err = ds
            .request(Request::new(Method::Post, "isAuthorized", "bob").data(json!({"action": "canRead"})))
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::Validation(_)));
    }
}
