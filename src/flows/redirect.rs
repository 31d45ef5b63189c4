//! Redirect Receivers
//!
//! Receive exactly one consent redirect: either through a one-shot HTTP
//! listener bound to the redirect URI's host and port, or from a URL the
//! user pastes into the terminal.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use url::{Host, Url};

use crate::core::state::constant_time_eq;
use crate::error::{AuthorizationError, ConfigurationError, CredentialError, CredentialResult};
use crate::types::{CallbackParams, RedirectMode};

const SUCCESS_HTML: &str = "<html><body><h1>Broker sign-in complete</h1><p>You may close this window.</p></body></html>";
const ERROR_HTML: &str = "<html><body><h1>Broker sign-in failed</h1><p>Close this window and retry from the application.</p></body></html>";
const NOT_FOUND_HTML: &str = "<html><body><h1>Not found</h1></body></html>";

const MAX_REQUEST_SIZE: usize = 16 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// A bound receiver, ready before the consent page is shown.
pub enum RedirectReceiver {
    Listener(LocalRedirectListener),
    Manual(ManualRedirectReceiver),
}

impl RedirectReceiver {
    /// Prepare the receiver for `mode`.
    pub async fn bind(mode: RedirectMode, redirect_uri: &Url) -> CredentialResult<Self> {
        match mode {
            RedirectMode::LocalListener => {
                Ok(Self::Listener(LocalRedirectListener::bind(redirect_uri).await?))
            }
            RedirectMode::ManualPaste => Ok(Self::Manual(ManualRedirectReceiver::stdin())),
        }
    }

    /// Wait for the redirect. The caller bounds the wait; dropping the future
    /// releases the listener.
    pub async fn receive(self, expected_state: &str) -> CredentialResult<CallbackParams> {
        match self {
            Self::Listener(listener) => listener.accept_redirect(expected_state).await,
            Self::Manual(manual) => manual.read_redirect().await,
        }
    }
}

/// One-shot HTTP listener for the consent redirect.
#[derive(Debug)]
pub struct LocalRedirectListener {
    listener: TcpListener,
    expected_path: String,
}

impl LocalRedirectListener {
    /// Bind to the host and port of `redirect_uri`.
    pub async fn bind(redirect_uri: &Url) -> CredentialResult<Self> {
        RedirectMode::LocalListener.check_redirect_uri(redirect_uri)?;

        let host = match redirect_uri.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            None => {
                return Err(ConfigurationError::InvalidEndpoint {
                    url: redirect_uri.to_string(),
                    message: "redirect URI has no host".to_string(),
                }
                .into())
            }
        };
        let port = redirect_uri.port_or_known_default().unwrap_or(80);
        let address = format!("{}:{}", host, port);

        let listener = TcpListener::bind((host.as_str(), port))
            .await
            .map_err(|e| AuthorizationError::ListenerFailed {
                address: address.clone(),
                message: e.to_string(),
            })?;

        tracing::debug!(address = %address, path = redirect_uri.path(), "Redirect listener bound");

        Ok(Self {
            listener,
            expected_path: redirect_uri.path().to_string(),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    /// Serve connections until one GET hits the expected path, answer it and
    /// return its parameters. Other requests get a 404 and are ignored.
    ///
    /// Connections are read concurrently, so an idle socket (a browser
    /// preconnect) does not hold up the redirect.
    pub async fn accept_redirect(self, expected_state: &str) -> CredentialResult<CallbackParams> {
        let mut pending = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (socket, peer) = accepted.map_err(|e| AuthorizationError::ListenerFailed {
                        address: self.local_addr().map(|a| a.to_string()).unwrap_or_default(),
                        message: e.to_string(),
                    })?;
                    pending.spawn(screen_request(socket, peer, self.expected_path.clone()));
                }
                Some(joined) = pending.join_next() => {
                    let Ok(Some((mut socket, peer, query))) = joined else {
                        continue;
                    };

                    let params = CallbackParams::from_query(&query);
                    let accepted = params.is_success()
                        && params
                            .state
                            .as_deref()
                            .is_some_and(|s| constant_time_eq(s.as_bytes(), expected_state.as_bytes()));

                    if accepted {
                        respond(&mut socket, "200 OK", SUCCESS_HTML).await;
                    } else {
                        respond(&mut socket, "400 Bad Request", ERROR_HTML).await;
                    }

                    tracing::debug!(peer = %peer, accepted, "Redirect received, closing listener");
                    return Ok(params);
                }
            }
        }
    }
}

/// Read one request. Anything but a GET on `expected_path` is answered here
/// and dropped; a candidate redirect is handed back with its query string.
async fn screen_request(
    mut socket: TcpStream,
    peer: SocketAddr,
    expected_path: String,
) -> Option<(TcpStream, SocketAddr, String)> {
    let target = match read_request_target(&mut socket).await {
        Ok(target) => target,
        Err(reason) => {
            tracing::debug!(peer = %peer, reason, "Ignoring malformed request");
            respond(&mut socket, "400 Bad Request", ERROR_HTML).await;
            return None;
        }
    };

    let (path, query) = target.split_once('?').unwrap_or((target.as_str(), ""));

    if path != expected_path {
        tracing::debug!(peer = %peer, path, "Ignoring request for unexpected path");
        respond(&mut socket, "404 Not Found", NOT_FOUND_HTML).await;
        return None;
    }

    let query = query.to_string();
    Some((socket, peer, query))
}

async fn read_request_target(socket: &mut TcpStream) -> Result<String, &'static str> {
    let mut buffer = Vec::with_capacity(2048);
    let mut chunk = [0u8; 2048];

    loop {
        let read = tokio::time::timeout(READ_TIMEOUT, socket.read(&mut chunk))
            .await
            .map_err(|_| "read timed out")?
            .map_err(|_| "read failed")?;
        if read == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..read]);
        if buffer.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if buffer.len() > MAX_REQUEST_SIZE {
            return Err("request too large");
        }
    }

    let request = String::from_utf8_lossy(&buffer);
    let first = request.lines().next().ok_or("empty request")?;
    let mut parts = first.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let target = parts.next().unwrap_or_default();

    if method != "GET" || !target.starts_with('/') {
        return Err("expected GET with an origin-form target");
    }

    Ok(target.to_string())
}

async fn respond(socket: &mut TcpStream, status: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.shutdown().await;
}

type PastedLines = Arc<Mutex<mpsc::UnboundedReceiver<String>>>;

static TERMINAL_LINES: OnceLock<PastedLines> = OnceLock::new();

/// Reads the redirected URL pasted by the user.
///
/// Lines come from a channel. For the terminal, one reader thread per process
/// feeds it, so an abandoned attempt never leaves a blocked read behind that
/// would swallow the next paste.
#[derive(Clone)]
pub struct ManualRedirectReceiver {
    lines: PastedLines,
}

impl ManualRedirectReceiver {
    /// Read from the terminal.
    pub fn stdin() -> Self {
        let lines = TERMINAL_LINES.get_or_init(|| {
            let (sender, receiver) = mpsc::unbounded_channel();
            let spawned = std::thread::Builder::new()
                .name("broker-auth-stdin".to_string())
                .spawn(move || forward_terminal_lines(sender));
            if let Err(e) = spawned {
                tracing::warn!(error = %e, "Cannot read pasted redirects from the terminal");
            }
            Arc::new(Mutex::new(receiver))
        });

        Self {
            lines: lines.clone(),
        }
    }

    /// Read pasted lines from `lines`.
    pub fn from_channel(lines: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            lines: Arc::new(Mutex::new(lines)),
        }
    }

    /// Prompt for and parse one pasted URL.
    ///
    /// Lines entered before the prompt belong to an earlier attempt and are
    /// discarded.
    pub async fn read_redirect(self) -> CredentialResult<CallbackParams> {
        let mut lines = self.lines.lock().await;

        let mut discarded = 0usize;
        while lines.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            tracing::debug!(discarded, "Discarded input from an earlier sign-in attempt");
        }

        eprintln!("After approving access, paste the full URL of the page you were redirected to:");

        let line = lines
            .recv()
            .await
            .ok_or_else(|| invalid_callback("terminal input is closed".to_string()))?;

        let line = line.trim();
        if line.is_empty() {
            return Err(invalid_callback("no URL was pasted".to_string()));
        }

        CallbackParams::from_url_str(line).map_err(|e| invalid_callback(e.to_string()))
    }
}

fn forward_terminal_lines(sender: mpsc::UnboundedSender<String>) {
    let stdin = std::io::stdin();
    loop {
        let mut line = String::new();
        match stdin.read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                if sender.send(line).is_err() {
                    break;
                }
            }
        }
    }
}

fn invalid_callback(message: String) -> CredentialError {
    CredentialError::Authorization(AuthorizationError::InvalidCallback { message })
}
