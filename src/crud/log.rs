//! Change log entries

use super::{CallContext, Crud};
use crate::error::Result;
use crate::feather::LOG;
use crate::store::Connection;
use serde_json::{Map, Value};

impl Crud {
    /// Append a `Log` record for a change to `object_id`
    pub(crate) async fn write_log(
        &self,
        conn: &dyn Connection,
        ctx: &CallContext,
        object_id: &str,
        action: &str,
        change: Value,
    ) -> Result<()> {
        let ctx = ctx.bypassed().cascade();
        let mut entry = Map::new();
        entry.insert("objectId".into(), Value::from(object_id));
        entry.insert("action".into(), Value::from(action));
        entry.insert("change".into(), change);
        self.insert_record(conn, &ctx, LOG, entry).await?;
        Ok(())
    }
}
