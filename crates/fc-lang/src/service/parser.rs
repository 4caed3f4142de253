//! Parser service: loads module schemas into parse results.

use std::path::Path;
use std::sync::Arc;

use crate::adapter::{BridgedObject, ParseResultAdapter};
use crate::bridge::protocol::{CallResult, ParserCall};
use crate::error::BridgeError;
use crate::model::schema;

use super::{CallContext, Router};

pub(super) async fn handle(
    r: &Router,
    ctx: &CallContext,
    call: ParserCall,
) -> Result<CallResult, BridgeError> {
    match call {
        ParserCall::ParseModule {
            dir,
            name,
            via_foreign,
        } => {
            if name.is_empty() || name.contains('/') {
                return Err(BridgeError::InvalidArgument(format!(
                    "bad module name '{name}'"
                )));
            }
            let schema = if via_foreign {
                let path = Path::new(&dir).join(format!("{name}.json"));
                let bytes = r
                    .env()
                    .reverse()?
                    .read_file(&path.to_string_lossy())
                    .await?;
                let text = String::from_utf8(bytes).map_err(|_| {
                    BridgeError::InvalidArgument(format!("{} is not UTF-8", path.display()))
                })?;
                schema::parse(&text, &name)?
            } else {
                schema::load(Path::new(&dir), &name).await?
            };
            tracing::debug!(module = %schema.module, via_foreign, "Parsed module");
            let adapter = ParseResultAdapter::new(schema, r.env().clone());
            Ok(r.register(ctx, BridgedObject::ParseResult(Arc::new(adapter))))
        }
    }
}
