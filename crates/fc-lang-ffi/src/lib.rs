//! C bindings for the fc-lang bridge.
//!
//! A host process starts the bridge with [`fc_bridge_start`], which serves the
//! socket protocol on a private runtime, and can then merge data into any
//! selection handle (including ones handed out over the socket) with
//! [`fc_select_upsert_from`]. The bridge pointer is the only context; there is
//! no global state.

use std::ffi::{CStr, CString, c_char};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::Arc;

use fc_lang::{Driver, DriverConfig, DriverError, ForeignCallBridge, logging::init_tracing};
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;

// ─── FFI types ──────────────────────────────────────────────────────────────

/// A selection handle as issued by the bridge.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FcSelect {
    pub mem_id: u64,
}

/// A JSON document, borrowed for the duration of the call.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FcNode {
    pub json: *const u8,
    pub len: usize,
}

/// Error returned to C. Free with [`fc_err_free`].
#[repr(C)]
pub struct FcErr {
    pub message: *mut c_char,
}

/// Opaque bridge instance.
pub struct FcBridge {
    runtime: Runtime,
    driver: Arc<Driver>,
    calls: ForeignCallBridge,
    server: JoinHandle<Result<(), DriverError>>,
}

impl FcBridge {
    fn start(socket: PathBuf, foreign_socket: PathBuf) -> Result<Self, String> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("fclang")
            .build()
            .map_err(|e| format!("failed to build runtime: {e}"))?;
        let config = DriverConfig::new(socket)
            .with_foreign_socket(foreign_socket)
            .with_env_overrides()
            .map_err(|e| e.to_string())?;
        let driver = runtime
            .block_on(Driver::start(config))
            .map_err(|e| e.to_string())?;
        let driver = Arc::new(driver);
        let server = runtime.spawn({
            let driver = driver.clone();
            async move { driver.serve().await }
        });
        Ok(Self {
            calls: driver.foreign_bridge(),
            runtime,
            driver,
            server,
        })
    }

    fn stop(self) {
        self.driver.stop();
        match self.runtime.block_on(self.server) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Bridge stopped with error"),
            Err(e) => tracing::warn!(error = %e, "Bridge server task failed"),
        }
    }
}

fn fc_err(message: impl Into<String>) -> *mut FcErr {
    let message = message.into().replace('\0', " ");
    let message = CString::new(message).unwrap_or_default();
    Box::into_raw(Box::new(FcErr {
        message: message.into_raw(),
    }))
}

unsafe fn path_arg(ptr: *const c_char) -> Option<PathBuf> {
    if ptr.is_null() {
        return None;
    }
    let s = unsafe { CStr::from_ptr(ptr) };
    Some(PathBuf::from(s.to_string_lossy().into_owned()))
}

// ─── Lifecycle ──────────────────────────────────────────────────────────────

/// Start serving on `sock_path`, dialing `x_sock_path` for forwarded calls
/// (null or empty runs standalone). Returns null on failure; the reason is
/// logged.
///
/// # Safety
///
/// Both arguments must be null or valid NUL-terminated strings.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fc_bridge_start(
    sock_path: *const c_char,
    x_sock_path: *const c_char,
) -> *mut FcBridge {
    init_tracing(false);
    let Some(socket) = (unsafe { path_arg(sock_path) }) else {
        tracing::error!("fc_bridge_start: null socket path");
        return std::ptr::null_mut();
    };
    let foreign = unsafe { path_arg(x_sock_path) }.unwrap_or_default();

    match catch_unwind(|| FcBridge::start(socket, foreign)) {
        Ok(Ok(bridge)) => Box::into_raw(Box::new(bridge)),
        Ok(Err(e)) => {
            tracing::error!(error = %e, "fc_bridge_start failed");
            std::ptr::null_mut()
        }
        Err(_) => {
            tracing::error!("fc_bridge_start panicked");
            std::ptr::null_mut()
        }
    }
}

/// Stop serving, release every handle and free the bridge.
///
/// # Safety
///
/// `bridge` must be null or a pointer from [`fc_bridge_start`] not yet
/// stopped. No other call may be using it.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fc_bridge_stop(bridge: *mut FcBridge) {
    if bridge.is_null() {
        return;
    }
    let bridge = *unsafe { Box::from_raw(bridge) };
    if catch_unwind(AssertUnwindSafe(|| bridge.stop())).is_err() {
        tracing::error!("fc_bridge_stop panicked");
    }
}

// ─── Calls ──────────────────────────────────────────────────────────────────

/// Merge `node` into the selection `sel`. Returns null on success.
///
/// # Safety
///
/// `bridge` must be a live pointer from [`fc_bridge_start`]. `node.json` must
/// point to `node.len` readable bytes (or be null with `len` 0). Must not be
/// called from a thread already driving an async runtime.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fc_select_upsert_from(
    bridge: *const FcBridge,
    sel: FcSelect,
    node: FcNode,
) -> *mut FcErr {
    let Some(bridge) = (unsafe { bridge.as_ref() }) else {
        return fc_err("null bridge");
    };
    let payload: &[u8] = if node.json.is_null() || node.len == 0 {
        &[]
    } else {
        unsafe { std::slice::from_raw_parts(node.json, node.len) }
    };

    let result = catch_unwind(AssertUnwindSafe(|| {
        bridge
            .runtime
            .block_on(bridge.calls.upsert_from(sel.mem_id, payload))
    }));
    match result {
        Ok(Ok(())) => std::ptr::null_mut(),
        Ok(Err(e)) => fc_err(e.to_string()),
        Err(_) => fc_err("panic during upsert"),
    }
}

/// # Safety
///
/// `err` must be null or a pointer returned by this library, freed once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fc_err_free(err: *mut FcErr) {
    if err.is_null() {
        return;
    }
    let err = unsafe { Box::from_raw(err) };
    if !err.message.is_null() {
        drop(unsafe { CString::from_raw(err.message) });
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    use fc_lang::bridge::codec::JsonCodec;
    use fc_lang::bridge::protocol::{
        Call, CallResult, NodeCall, Outcome, ParserCall, Request, ServerFrame,
    };
    use fc_lang::bridge::transport;
    use fc_lang::nodeutil::{WireValue, encode};
    use futures::{SinkExt, StreamExt};
    use serde_json::json;
    use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
    use tokio_util::codec::{FramedRead, FramedWrite};

    use super::*;

    const ECHO: &str = r#"{
        "module": "echo",
        "definitions": [
            {"kind": "leaf", "ident": "f", "type": "int32"},
            {"kind": "container", "ident": "g", "children": [
                {"kind": "leaf", "ident": "s", "type": "string"}
            ]}
        ]
    }"#;

    struct Client {
        runtime: Runtime,
        rx: FramedRead<OwnedReadHalf, JsonCodec<ServerFrame>>,
        tx: FramedWrite<OwnedWriteHalf, JsonCodec<Request>>,
        next_id: u64,
    }

    impl Client {
        fn connect(path: &Path) -> Self {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let stream = runtime.block_on(transport::connect(path)).unwrap();
            let (rx, tx) = transport::framed(stream);
            Self {
                runtime,
                rx,
                tx,
                next_id: 1,
            }
        }

        fn ok(&mut self, call: Call) -> CallResult {
            let id = self.next_id;
            self.next_id += 1;
            let Self { runtime, rx, tx, .. } = self;
            runtime.block_on(async {
                tx.send(Request { id, call }).await.unwrap();
                match rx.next().await.unwrap().unwrap() {
                    ServerFrame::Reply {
                        id: got,
                        outcome: Outcome::Ok { result },
                    } if got == id => result,
                    other => panic!("unexpected frame {other:?}"),
                }
            })
        }

        fn handle(&mut self, call: Call) -> u64 {
            match self.ok(call) {
                CallResult::Handle { hnd, .. } => hnd,
                other => panic!("expected a handle, got {other:?}"),
            }
        }
    }

    fn c_path(path: &Path) -> CString {
        CString::new(path.as_os_str().as_bytes()).unwrap()
    }

    fn upsert(bridge: *const FcBridge, hnd: u64, json: &[u8]) -> Result<(), String> {
        let node = FcNode {
            json: json.as_ptr(),
            len: json.len(),
        };
        let err = unsafe { fc_select_upsert_from(bridge, FcSelect { mem_id: hnd }, node) };
        if err.is_null() {
            return Ok(());
        }
        let message = unsafe { CStr::from_ptr((*err).message) }
            .to_string_lossy()
            .into_owned();
        unsafe { fc_err_free(err) };
        Err(message)
    }

    #[test]
    fn upsert_through_c_is_visible_over_the_socket() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("echo.json"), ECHO).unwrap();
        let sock = dir.path().join("fc.sock");
        let bridge = unsafe { fc_bridge_start(c_path(&sock).as_ptr(), std::ptr::null()) };
        assert!(!bridge.is_null());

        let mut client = Client::connect(&sock);
        let module = client.handle(Call::Parser(ParserCall::ParseModule {
            dir: dir.path().display().to_string(),
            name: "echo".into(),
            via_foreign: false,
        }));
        let root = client.handle(Call::Node(NodeCall::Root {
            module,
            foreign_node: None,
        }));

        upsert(bridge, root, br#"{"g": {"s": "coffee"}}"#).unwrap();
        assert_eq!(
            client.ok(Call::Node(NodeCall::Read {
                hnd: root,
                path: "g".into(),
            })),
            CallResult::Value {
                value: encode(&json!({"s": "coffee"}))
            }
        );

        client.ok(Call::Node(NodeCall::Write {
            hnd: root,
            path: "f".into(),
            value: WireValue::Int(7),
        }));
        upsert(bridge, root, br#"{"g": {"s": "tea"}}"#).unwrap();
        assert_eq!(
            client.ok(Call::Node(NodeCall::Read {
                hnd: root,
                path: "".into(),
            })),
            CallResult::Value {
                value: encode(&json!({"f": 7, "g": {"s": "tea"}}))
            }
        );

        unsafe { fc_bridge_stop(bridge) };
        assert!(!sock.exists());
    }

    #[test]
    fn errors_come_back_as_messages() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("fc.sock");
        let empty = CString::new("").unwrap();
        let bridge = unsafe { fc_bridge_start(c_path(&sock).as_ptr(), empty.as_ptr()) };
        assert!(!bridge.is_null());

        let err = upsert(bridge, 42, b"{}").unwrap_err();
        assert!(err.contains("42"), "{err}");
        assert_eq!(upsert(std::ptr::null(), 1, b"{}").unwrap_err(), "null bridge");

        unsafe { fc_bridge_stop(bridge) };
        unsafe { fc_bridge_stop(std::ptr::null_mut()) };
        unsafe { fc_err_free(std::ptr::null_mut()) };
    }

    #[test]
    fn start_fails_without_foreign_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let sock = c_path(&dir.path().join("fc.sock"));
        let missing = c_path(&dir.path().join("nobody.sock"));
        let bridge = unsafe { fc_bridge_start(sock.as_ptr(), missing.as_ptr()) };
        assert!(bridge.is_null());
        assert!(unsafe { fc_bridge_start(std::ptr::null(), std::ptr::null()) }.is_null());
    }
}
