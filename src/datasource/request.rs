//! Requests accepted by the datasource

use crate::crud::Query;
use crate::events::SubscriptionRequest;
use crate::tools::Filter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Request verb
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Patch,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        };
        f.write_str(verb)
    }
}

impl FromStr for Method {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PATCH" => Ok(Method::Patch),
            "DELETE" => Ok(Method::Delete),
            other => Err(format!("Unknown method: {}", other)),
        }
    }
}

/// One call into the engine: a CRUD operation on a feather or a registered
/// function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub method: Method,
    /// Feather name, feather plural or function name
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Record for POST, JSON patch for PATCH, arguments for functions
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Filter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<SubscriptionRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub is_hard: bool,
    #[serde(default)]
    pub show_deleted: bool,
}

impl Request {
    pub fn new(method: Method, name: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            method,
            name: name.into(),
            id: None,
            data: Value::Null,
            filter: None,
            properties: None,
            subscription: None,
            session_id: None,
            user: user.into(),
            is_hard: false,
            show_deleted: false,
        }
    }

    pub fn get(name: impl Into<String>, user: impl Into<String>) -> Self {
        Self::new(Method::Get, name, user)
    }

    pub fn post(name: impl Into<String>, user: impl Into<String>, data: Value) -> Self {
        Self::new(Method::Post, name, user).data(data)
    }

    pub fn patch(
        name: impl Into<String>,
        user: impl Into<String>,
        id: impl Into<String>,
        patch: Value,
    ) -> Self {
        Self::new(Method::Patch, name, user).id(id).data(patch)
    }

    pub fn delete(name: impl Into<String>, user: impl Into<String>, id: impl Into<String>) -> Self {
        Self::new(Method::Delete, name, user).id(id)
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn properties(mut self, properties: &[&str]) -> Self {
        self.properties = Some(properties.iter().map(|p| p.to_string()).collect());
        self
    }

    pub fn subscription(mut self, subscription: SubscriptionRequest) -> Self {
        self.subscription = Some(subscription);
        self
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn hard(mut self) -> Self {
        self.is_hard = true;
        self
    }

    pub fn show_deleted(mut self) -> Self {
        self.show_deleted = true;
        self
    }

    /// Read options carried by a GET
    pub fn query(&self) -> Query {
        Query {
            filter: self.filter.clone(),
            properties: self.properties.clone(),
            subscription: self.subscription.clone(),
            show_deleted: self.show_deleted,
        }
    }

    /// Id of the target record: the request id, else `data.id`
    pub fn target_id(&self) -> Option<&str> {
        self.id
            .as_deref()
            .or_else(|| self.data.get("id").and_then(Value::as_str))
            .filter(|id| !id.is_empty())
    }
}
