//! HTTP admin API for wssocks
//!
//! Served on the WebSocket listener under `/api/` when an API key is
//! configured. Every request must carry the key in the `X-API-Key` header.

use crate::server::{ReverseTokenOptions, WsSocksServer};
use http::header::CONTENT_TYPE;
use hyper::{Body, Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};

/// API handler for WsSocksServer
pub struct ApiHandler {
    /// Server instance
    server: WsSocksServer,

    /// API key for authentication
    api_key: String,
}

/// API response envelope
#[derive(Serialize, Deserialize)]
struct ApiResponse<T> {
    /// Success status
    success: bool,

    /// Error message if success is false
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,

    /// Data if success is true
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        ApiResponse {
            success: true,
            error: None,
            data: Some(data),
        }
    }

    fn err(error: String) -> Self {
        ApiResponse {
            success: false,
            error: Some(error),
            data: None,
        }
    }
}

/// Token information
#[derive(Serialize, Deserialize)]
struct TokenInfo {
    /// Token
    token: String,

    /// Assigned SOCKS5 port (reverse tokens only)
    port: Option<u16>,

    /// Number of connected clients
    client_count: usize,
}

/// Server status
#[derive(Serialize, Deserialize)]
struct ServerStatus {
    /// Total client count
    client_count: usize,

    /// Reverse token count
    reverse_token_count: usize,

    /// Forward token count
    forward_token_count: usize,
}

/// Add token request
#[derive(Deserialize)]
struct AddTokenRequest {
    /// Token (optional)
    token: Option<String>,

    /// Port (optional)
    port: Option<u16>,

    /// SOCKS5 username (optional)
    username: Option<String>,

    /// SOCKS5 password (optional)
    password: Option<String>,

    /// Reverse mode
    reverse: bool,
}

impl ApiHandler {
    /// Create a new ApiHandler
    pub fn new(server: WsSocksServer, api_key: String) -> Self {
        ApiHandler { server, api_key }
    }

    /// Handle an API request
    pub async fn handle_request(&self, req: Request<Body>) -> Response<Body> {
        let authorized = req
            .headers()
            .get("X-API-Key")
            .and_then(|value| value.to_str().ok())
            == Some(self.api_key.as_str());
        if !authorized {
            return json_response(
                StatusCode::UNAUTHORIZED,
                &ApiResponse::<()>::err("Invalid API key".to_string()),
            );
        }

        match (req.method(), req.uri().path()) {
            (&Method::GET, "/api/status") => self.handle_status().await,
            (&Method::POST, "/api/tokens") => self.handle_add_token(req).await,
            (&Method::DELETE, path) if path.starts_with("/api/tokens/") => {
                let token = path.trim_start_matches("/api/tokens/").to_string();
                self.handle_remove_token(&token).await
            }
            _ => json_response(
                StatusCode::NOT_FOUND,
                &ApiResponse::<()>::err("Not found".to_string()),
            ),
        }
    }

    /// Report server-wide counters
    async fn handle_status(&self) -> Response<Body> {
        let status = ServerStatus {
            client_count: self.server.client_count().await,
            reverse_token_count: self.server.reverse_token_count().await,
            forward_token_count: self.server.forward_token_count().await,
        };
        json_response(StatusCode::OK, &ApiResponse::ok(status))
    }

    /// Create a reverse or forward token
    async fn handle_add_token(&self, req: Request<Body>) -> Response<Body> {
        let body = match hyper::body::to_bytes(req.into_body()).await {
            Ok(body) => body,
            Err(e) => {
                return json_response(
                    StatusCode::BAD_REQUEST,
                    &ApiResponse::<()>::err(format!("Failed to read body: {}", e)),
                )
            }
        };
        let request: AddTokenRequest = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => {
                return json_response(
                    StatusCode::BAD_REQUEST,
                    &ApiResponse::<()>::err(format!("Invalid request: {}", e)),
                )
            }
        };

        if request.reverse {
            let opts = ReverseTokenOptions {
                token: request.token,
                port: request.port,
                username: request.username,
                password: request.password,
            };
            match self.server.add_reverse_token(opts).await {
                Ok(result) => {
                    let client_count = self.server.token_client_count(&result.token).await;
                    json_response(
                        StatusCode::OK,
                        &ApiResponse::ok(TokenInfo {
                            token: result.token,
                            port: Some(result.port),
                            client_count,
                        }),
                    )
                }
                Err(e) => json_response(StatusCode::CONFLICT, &ApiResponse::<()>::err(e.to_string())),
            }
        } else {
            match self.server.add_forward_token(request.token).await {
                Ok(token) => {
                    let client_count = self.server.token_client_count(&token).await;
                    json_response(
                        StatusCode::OK,
                        &ApiResponse::ok(TokenInfo {
                            token,
                            port: None,
                            client_count,
                        }),
                    )
                }
                Err(e) => json_response(StatusCode::CONFLICT, &ApiResponse::<()>::err(e.to_string())),
            }
        }
    }

    /// Remove a token of either kind
    async fn handle_remove_token(&self, token: &str) -> Response<Body> {
        if self.server.remove_token(token).await {
            json_response(
                StatusCode::OK,
                &ApiResponse::<()> {
                    success: true,
                    error: None,
                    data: None,
                },
            )
        } else {
            json_response(
                StatusCode::NOT_FOUND,
                &ApiResponse::<()>::err("Unknown token".to_string()),
            )
        }
    }
}

fn json_response<T: Serialize>(status: StatusCode, payload: &ApiResponse<T>) -> Response<Body> {
    let body = serde_json::to_string(payload)
        .unwrap_or_else(|_| "{\"success\":false}".to_string());
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap()
}
