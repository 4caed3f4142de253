//! File system service. Files come from local disk or, with `via_foreign`,
//! from the foreign process through the reverse channel.

use std::path::Path;
use std::sync::Arc;

use base64::Engine as _;

use crate::adapter::{BridgedObject, FileHandleAdapter, FileSource, io_error};
use crate::bridge::protocol::{CallResult, FileSystemCall};
use crate::error::BridgeError;
use crate::handle::Operation;

use super::{CallContext, Router};

pub(super) async fn handle(
    r: &Router,
    ctx: &CallContext,
    call: FileSystemCall,
) -> Result<CallResult, BridgeError> {
    match call {
        FileSystemCall::Open { path, via_foreign } => {
            let source = if via_foreign {
                FileSource::Foreign(r.env().reverse()?.clone())
            } else {
                let meta = tokio::fs::metadata(&path)
                    .await
                    .map_err(|e| io_error(Path::new(&path), e))?;
                if meta.is_dir() {
                    return Err(BridgeError::InvalidArgument(format!("{path} is a directory")));
                }
                FileSource::Local
            };
            let file = FileHandleAdapter::new(path, source);
            Ok(r.register(ctx, BridgedObject::FileHandle(Arc::new(file))))
        }
        FileSystemCall::Read { hnd } => {
            let object = r.table().require(hnd, Operation::Read)?;
            let bytes = object.as_file(Operation::Read)?.contents().await?;
            Ok(CallResult::Bytes {
                data: base64::engine::general_purpose::STANDARD.encode(bytes),
            })
        }
        FileSystemCall::Stat { path } => {
            let meta = tokio::fs::metadata(&path)
                .await
                .map_err(|e| io_error(Path::new(&path), e))?;
            Ok(CallResult::FileInfo {
                path,
                len: meta.len(),
                is_dir: meta.is_dir(),
            })
        }
    }
}
