//! Selections whose data lives in the foreign process.
//!
//! The foreign side hands out opaque node tokens; every call on a
//! [`RemoteSelection`] is forwarded over the reverse channel with that token
//! unchanged.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{EditOp, EventSink, ModelError, NotificationGuard, Selection, join_path};
use crate::bridge::protocol::{CallResult, XCall, XNodeCall};
use crate::error::BridgeError;
use crate::nodeutil::{decode, encode};
use crate::reverse::ReverseChannel;

pub struct RemoteSelection {
    channel: Arc<ReverseChannel>,
    node: u64,
    path: String,
}

impl RemoteSelection {
    pub fn new(channel: Arc<ReverseChannel>, node: u64) -> Self {
        Self {
            channel,
            node,
            path: String::new(),
        }
    }

    pub fn node(&self) -> u64 {
        self.node
    }

    async fn forward(&self, call: XNodeCall) -> Result<CallResult, ModelError> {
        Ok(self.channel.call(XCall::XNode(call)).await?)
    }
}

fn unexpected(result: CallResult) -> ModelError {
    ModelError::Forward(BridgeError::Adapter(format!(
        "unexpected reply from foreign node: {result:?}"
    )))
}

#[async_trait]
impl Selection for RemoteSelection {
    fn path(&self) -> String {
        self.path.clone()
    }

    async fn read(&self, path: &str) -> Result<Value, ModelError> {
        match self
            .forward(XNodeCall::Read {
                node: self.node,
                path: path.to_string(),
            })
            .await?
        {
            CallResult::Value { value } => Ok(decode(value)?),
            CallResult::Maybe { value } => Ok(value.map(decode).transpose()?.unwrap_or(Value::Null)),
            other => Err(unexpected(other)),
        }
    }

    async fn write(&self, path: &str, value: Value) -> Result<(), ModelError> {
        match self
            .forward(XNodeCall::Write {
                node: self.node,
                path: path.to_string(),
                value: encode(&value),
            })
            .await?
        {
            CallResult::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn action(&self, name: &str, input: Option<Value>) -> Result<Option<Value>, ModelError> {
        match self
            .forward(XNodeCall::Action {
                node: self.node,
                name: name.to_string(),
                input: input.as_ref().map(encode),
            })
            .await?
        {
            CallResult::Done => Ok(None),
            CallResult::Maybe { value } => Ok(value.map(decode).transpose()?),
            CallResult::Value { value } => Ok(Some(decode(value)?)),
            other => Err(unexpected(other)),
        }
    }

    async fn find(&self, path: &str) -> Result<Arc<dyn Selection>, ModelError> {
        match self
            .forward(XNodeCall::Find {
                node: self.node,
                path: path.to_string(),
            })
            .await?
        {
            CallResult::Node { node } => Ok(Arc::new(RemoteSelection {
                channel: self.channel.clone(),
                node,
                path: join_path(&self.path, path),
            })),
            other => Err(unexpected(other)),
        }
    }

    async fn notifications(&self, sink: EventSink) -> Result<NotificationGuard, ModelError> {
        let stream = self.channel.open_stream(sink);
        let subscribed = self
            .forward(XNodeCall::Subscribe {
                node: self.node,
                stream,
            })
            .await;
        if let Err(e) = subscribed {
            self.channel.close_stream(stream);
            return Err(e);
        }

        let channel = self.channel.clone();
        Ok(NotificationGuard::new(move || {
            channel.close_stream(stream);
            // Telling the foreign side is best effort; the stream is already
            // gone locally, so late events are dropped either way.
            if let Ok(rt) = tokio::runtime::Handle::try_current() {
                rt.spawn(async move {
                    if let Err(e) = channel
                        .call(XCall::XNode(XNodeCall::Unsubscribe { stream }))
                        .await
                    {
                        tracing::debug!(stream, error = %e, "Foreign unsubscribe failed");
                    }
                });
            }
        }))
    }

    async fn edit(&self, op: EditOp, value: Value) -> Result<(), ModelError> {
        match self
            .forward(XNodeCall::Edit {
                node: self.node,
                op,
                value: encode(&value),
            })
            .await?
        {
            CallResult::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}
