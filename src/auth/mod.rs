//! Authorization: roles, grants, and the acting identity of a request

pub mod extractor;
pub mod grants;

pub use extractor::Actor;
pub use grants::{define_tables, remove_grants, write_grant, Authorizer, Target, DEFAULT_SUPER_ROLE, EVERYONE, ROLE_MEMBER_TABLE};
