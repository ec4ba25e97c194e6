// ABOUTME: Loopback HTTP listener that receives the OAuth authorization redirect
// ABOUTME: Dispatches code and state to the callback registered for that state, then shuts itself down

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError,
};
use std::time::Duration;

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::watch,
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    error::{AuthError, AuthResult},
    oauth::registry::{CallbackRegistry, CallbackResult},
};

/// Number of successive ports tried before giving up
pub const DEFAULT_PORT_ATTEMPTS: u16 = 10;

const MAX_REQUEST_BYTES: usize = 8192;
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle of a callback server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Idle,
    Bound,
    Serving,
    ShuttingDown,
    Stopped,
}

/// State shared between the server handle and its accept loop
struct ServerContext {
    callback_path: String,
    registry: CallbackRegistry,
    stateless_fallback: bool,
    completed: AtomicBool,
    state: Mutex<ServerState>,
    shutdown: watch::Sender<bool>,
}

impl ServerContext {
    fn set_state(&self, next: ServerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    fn state(&self) -> ServerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn request_shutdown(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != ServerState::Stopped {
                *state = ServerState::ShuttingDown;
            }
        }
        self.shutdown.send_replace(true);
    }
}

/// OAuth callback server for one authorization attempt
pub struct CallbackServer {
    preferred_port: u16,
    max_attempts: u16,
    port: Option<u16>,
    context: Arc<ServerContext>,
    task: Option<JoinHandle<()>>,
}

impl CallbackServer {
    pub fn new(
        preferred_port: u16,
        callback_path: impl Into<String>,
        registry: CallbackRegistry,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            preferred_port,
            max_attempts: DEFAULT_PORT_ATTEMPTS,
            port: None,
            context: Arc::new(ServerContext {
                callback_path: callback_path.into(),
                registry,
                stateless_fallback: false,
                completed: AtomicBool::new(false),
                state: Mutex::new(ServerState::Idle),
                shutdown,
            }),
            task: None,
        }
    }

    /// Also dispatch to a callback registered under the empty state.
    /// Weakens CSRF protection; only for legacy clients.
    pub fn with_stateless_fallback(mut self, enabled: bool) -> Self {
        if let Some(context) = Arc::get_mut(&mut self.context) {
            context.stateless_fallback = enabled;
        }
        self
    }

    pub fn with_max_attempts(mut self, attempts: u16) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Bind a loopback port and start serving in the background.
    ///
    /// Returns the port actually bound, which differs from the preferred port
    /// when that one is taken.
    pub async fn start(&mut self) -> AuthResult<u16> {
        if self.context.state() != ServerState::Idle {
            return Err(AuthError::CallbackServer(
                "Callback server can only be started once".to_string(),
            ));
        }

        let listener = self.bind().await?;
        let port = listener
            .local_addr()
            .map_err(|e| AuthError::CallbackServer(format!("Failed to read local address: {}", e)))?
            .port();
        self.port = Some(port);
        self.context.set_state(ServerState::Bound);

        if port != self.preferred_port && self.preferred_port != 0 {
            warn!(
                "Port {} is in use, callback server moved to port {}",
                self.preferred_port, port
            );
        }
        info!(
            "📡 Waiting for OAuth callback on http://localhost:{}{}",
            port, self.context.callback_path
        );

        let context = Arc::clone(&self.context);
        let shutdown_rx = self.context.shutdown.subscribe();
        context.set_state(ServerState::Serving);
        self.task = Some(tokio::spawn(accept_loop(listener, context, shutdown_rx)));

        Ok(port)
    }

    async fn bind(&self) -> AuthResult<TcpListener> {
        let mut attempts = 0u16;
        for offset in 0..self.max_attempts {
            let Some(port) = self.preferred_port.checked_add(offset) else {
                break;
            };
            attempts += 1;

            match TcpListener::bind(("127.0.0.1", port)).await {
                Ok(listener) => return Ok(listener),
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    debug!("Port {} is in use, trying the next one", port);
                }
                Err(e) => {
                    return Err(AuthError::CallbackServer(format!(
                        "Failed to bind to 127.0.0.1:{}: {}",
                        port, e
                    )));
                }
            }
        }

        error!(
            "No free port for the callback server in {} attempts from {}",
            attempts, self.preferred_port
        );
        Err(AuthError::PortInUse {
            port: self.preferred_port,
            attempts,
        })
    }

    /// Port bound by `start`, if any
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn state(&self) -> ServerState {
        self.context.state()
    }

    /// True once a registered callback has been dispatched and answered
    pub fn is_complete(&self) -> bool {
        self.context.completed.load(Ordering::SeqCst)
    }

    /// True while the accept loop task is alive
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop serving and wait for the accept loop to exit. Safe to call in any state.
    pub async fn stop(&mut self) {
        match self.task.take() {
            Some(task) => {
                self.context.request_shutdown();
                if let Err(e) = task.await {
                    warn!("Callback server task ended abnormally: {}", e);
                }
                debug!("Callback server stopped");
            }
            None => {
                if self.context.state() == ServerState::Stopped {
                    return;
                }
            }
        }
        self.context.set_state(ServerState::Stopped);
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            self.context.shutdown.send_replace(true);
            task.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    context: Arc<ServerContext>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    debug!("Received connection from {}", peer_addr);
                    tokio::spawn(handle_connection(stream, Arc::clone(&context)));
                }
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                }
            }
        }
    }

    context.set_state(ServerState::Stopped);
    debug!("Callback server accept loop exited");
}

async fn handle_connection(mut stream: TcpStream, context: Arc<ServerContext>) {
    let request = match tokio::time::timeout(REQUEST_READ_TIMEOUT, read_request(&mut stream)).await
    {
        Ok(Ok(request)) => request,
        Ok(Err(e)) => {
            debug!("Failed to read request: {}", e);
            return;
        }
        Err(_) => {
            debug!("Timed out reading request");
            return;
        }
    };

    let (response, dispatched) = match respond(&request, &context).await {
        Ok(answer) => answer,
        Err(e) => {
            error!("Failed to handle callback request: {}", e);
            (HttpResponse::internal_error(), false)
        }
    };

    if let Err(e) = write_response(&mut stream, &response).await {
        error!("Failed to send response: {}", e);
    }

    if dispatched {
        context.completed.store(true, Ordering::SeqCst);
        context.request_shutdown();
    }
}

async fn read_request(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
        if buffer.windows(4).any(|w| w == b"\r\n\r\n") || buffer.len() >= MAX_REQUEST_BYTES {
            break;
        }
    }

    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

async fn write_response(stream: &mut TcpStream, response: &HttpResponse) -> std::io::Result<()> {
    stream.write_all(response.to_http().as_bytes()).await?;
    stream.flush().await?;
    stream.shutdown().await
}

/// Build the response for one request. The flag reports whether a callback ran.
async fn respond(request: &str, context: &ServerContext) -> AuthResult<(HttpResponse, bool)> {
    let target = request
        .lines()
        .next()
        .and_then(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some("GET"), Some(target)) => Some(target),
                _ => None,
            }
        })
        .unwrap_or("");

    let url = Url::parse("http://localhost")
        .and_then(|base| base.join(target))
        .map_err(|e| AuthError::CallbackServer(format!("Malformed request target: {}", e)))?;

    if target.is_empty() || url.path() != context.callback_path {
        return Ok((HttpResponse::not_found(), false));
    }

    let params: HashMap<String, String> = url.query_pairs().into_owned().collect();
    let code = params.get("code").filter(|c| !c.is_empty());
    let state = params.get("state").filter(|s| !s.is_empty());

    let (Some(code), Some(state)) = (code, state) else {
        if let Some(provider_error) = params.get("error") {
            warn!("Provider returned an authorization error: {}", provider_error);
        }
        return Ok((
            HttpResponse::page(400, false, "Error: Missing code or state parameters"),
            false,
        ));
    };

    let callback = context.registry.take(state).or_else(|| {
        if context.stateless_fallback {
            warn!("Dispatching callback registered without a state token");
            context.registry.take("")
        } else {
            None
        }
    });

    let Some(callback) = callback else {
        if context.registry.is_processed(state) {
            warn!("Callback received for a state that was already used");
            return Ok((
                HttpResponse::page(400, false, "Error: This authorization has already been used"),
                false,
            ));
        }
        warn!("Callback received with unknown state token");
        return Ok((
            HttpResponse::page(400, false, "Error: Invalid or expired state token"),
            false,
        ));
    };

    info!("Received authorization code, dispatching to registered callback");
    let result: CallbackResult = tokio::spawn(callback(code.clone(), state.clone()))
        .await
        .map_err(|e| AuthError::CallbackServer(format!("Callback task failed: {}", e)))?;

    Ok((HttpResponse::page(200, result.success, &result.message), true))
}

struct HttpResponse {
    status: u16,
    content_type: &'static str,
    body: String,
}

impl HttpResponse {
    fn page(status: u16, success: bool, message: &str) -> Self {
        Self {
            status,
            content_type: "text/html; charset=utf-8",
            body: result_page(success, message),
        }
    }

    fn not_found() -> Self {
        Self {
            status: 404,
            content_type: "text/html; charset=utf-8",
            body: NOT_FOUND_HTML.to_string(),
        }
    }

    fn internal_error() -> Self {
        Self {
            status: 500,
            content_type: "text/plain; charset=utf-8",
            body: "Internal server error".to_string(),
        }
    }

    fn to_http(&self) -> String {
        let reason = match self.status {
            200 => "OK",
            400 => "Bad Request",
            404 => "Not Found",
            _ => "Internal Server Error",
        };
        format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            self.status,
            reason,
            self.content_type,
            self.body.len(),
            self.body
        )
    }
}

fn result_page(success: bool, message: &str) -> String {
    let (title, color, background, hint) = if success {
        (
            "Authentication Successful",
            "#4CAF50",
            "#E8F5E9",
            "You can now close this window and return to your terminal.",
        )
    } else {
        (
            "Authentication Failed",
            "#F44336",
            "#FFEBEE",
            "Please try again or check the logs for more information.",
        )
    };

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Courier - Authentication</title>
    <style>
        body {{ font-family: system-ui, -apple-system, sans-serif; max-width: 600px; margin: 100px auto; text-align: center; }}
        h1 {{ color: {color}; }}
        .message {{ margin: 20px 0; padding: 10px; background-color: {background}; border-radius: 5px; }}
        p {{ color: #64748b; }}
    </style>
</head>
<body>
    <h1>{title}</h1>
    <div class="message">{message}</div>
    <p>{hint}</p>
    <p>This window will automatically close in 5 seconds.</p>
    <script>setTimeout(function() {{ window.close(); }}, 5000);</script>
</body>
</html>"#,
        color = color,
        background = background,
        title = title,
        message = escape_html(message),
        hint = hint,
    )
}

fn escape_html(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

const NOT_FOUND_HTML: &str = r#"<html>
<head><title>Not Found</title></head>
<body><h1>404 Not Found</h1></body>
</html>"#;
