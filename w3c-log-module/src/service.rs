// Copyright 2024 Wladimir Palant
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Interfaces between the access log and the HTTP server it is embedded into

use async_trait::async_trait;
use bytes::Bytes;
use http::header::AsHeaderName;
use http::request::Parts;
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use std::fmt::Debug;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::HijackError;

/// Request metadata as received from the client
#[derive(Debug, Clone, Default)]
pub struct RequestHead {
    /// Address of the client if known
    pub remote_addr: Option<SocketAddr>,
    /// Request method
    pub method: Method,
    /// Request URI as sent by the client
    pub uri: Uri,
    /// Protocol version of the request
    pub version: Version,
    /// Request headers
    pub headers: HeaderMap,
}

impl RequestHead {
    /// Creates request metadata from the parts of an [`http::Request`].
    pub fn from_parts(parts: &Parts, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            remote_addr,
            method: parts.method.clone(),
            uri: parts.uri.clone(),
            version: parts.version,
            headers: parts.headers.clone(),
        }
    }

    /// Returns the value of a request header or an empty string if the header is missing. Invalid
    /// UTF-8 is replaced.
    pub fn header_str(&self, name: impl AsHeaderName) -> String {
        self.headers
            .get(name)
            .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
            .unwrap_or_default()
    }
}

/// A raw transport that a handler can take over
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> Connection for T {}

/// Result of taking over the connection from the HTTP layer
pub struct Hijacked {
    /// The transport, from now on owned by the handler
    pub connection: Box<dyn Connection>,
    /// Data already read from the connection by the HTTP layer but not consumed yet
    pub read_buffer: Bytes,
}

impl Debug for Hijacked {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hijacked")
            .field("read_buffer", &self.read_buffer)
            .finish_non_exhaustive()
    }
}

/// The response side of a request
#[async_trait]
pub trait ResponseWriter: Send {
    /// Response headers, these are sent with the status code.
    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Sends the status code and headers.
    async fn write_header(&mut self, status: StatusCode) -> Result<(), io::Error>;

    /// Sends part of the response body, sending headers with status 200 first if necessary.
    async fn write_body(&mut self, data: &[u8]) -> Result<usize, io::Error>;

    /// Takes over the underlying transport.
    ///
    /// Once this succeeds, the HTTP layer will no longer touch the connection. Responses that
    /// don’t support this keep the default implementation.
    fn hijack(&mut self) -> Result<Hijacked, HijackError> {
        Err(HijackError::NotSupported)
    }
}

/// Something handling HTTP requests
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handles one request.
    async fn handle(&self, request: &RequestHead, response: &mut dyn ResponseWriter);
}

#[async_trait]
impl<H: Handler + ?Sized> Handler for Arc<H> {
    async fn handle(&self, request: &RequestHead, response: &mut dyn ResponseWriter) {
        (**self).handle(request, response).await
    }
}
