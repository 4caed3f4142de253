use crate::bridge::protocol::{CallResult, HandlesCall};
use crate::error::BridgeError;
use crate::handle::Handle;

use super::Router;

pub(super) fn handle(r: &Router, call: HandlesCall) -> Result<CallResult, BridgeError> {
    match call {
        HandlesCall::Release { hnd } => {
            r.table().release(Handle::from_raw(hnd)?)?;
            Ok(CallResult::Done)
        }
        HandlesCall::Kind { hnd } => Ok(CallResult::Kind {
            object: r.table().kind_of(hnd)?,
        }),
        HandlesCall::Stats => Ok(CallResult::Stats {
            handles: r.table().len(),
            subscriptions: r.hub().open(),
        }),
    }
}
