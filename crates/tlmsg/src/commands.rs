//! Typed commands for a translateLocally peer.
//!
//! The client core treats command names and payloads as opaque; this module
//! is the one place that knows their shapes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::client::{Client, ResponseHandle};
use crate::error::ClientError;
use crate::pending::ProgressSink;

/// Requests understood by the peer.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    ListModels { include_remote: bool },
    Translate(TranslateRequest),
    DownloadModel { model_id: String },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ListModels { .. } => "ListModels",
            Self::Translate(_) => "Translate",
            Self::DownloadModel { .. } => "DownloadModel",
        }
    }

    /// Request `data` object.
    pub fn data(&self) -> Result<Value, ClientError> {
        let data = match self {
            Self::ListModels { include_remote } => {
                serde_json::json!({ "includeRemote": include_remote })
            }
            Self::Translate(request) => {
                serde_json::to_value(request).map_err(ClientError::Encode)?
            }
            Self::DownloadModel { model_id } => serde_json::json!({ "modelID": model_id }),
        };
        Ok(data)
    }
}

/// Text to translate and how to pick the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranslateRequest {
    pub text: String,
    pub html: bool,
    #[serde(flatten)]
    pub route: TranslateRoute,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TranslateRoute {
    /// Let the peer choose a model (or a pivot pair) for this language pair.
    Languages { src: String, trg: String },
    /// A specific installed model, optionally chained through a second one.
    Model {
        model: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pivot: Option<String>,
    },
}

impl TranslateRequest {
    pub fn new(src: impl Into<String>, trg: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            html: false,
            route: TranslateRoute::Languages {
                src: src.into(),
                trg: trg.into(),
            },
        }
    }

    pub fn with_model(model: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            html: false,
            route: TranslateRoute::Model {
                model: model.into(),
                pivot: None,
            },
        }
    }

    /// Set the pivot model. Only meaningful with [`TranslateRoute::Model`].
    pub fn pivot(mut self, pivot: impl Into<String>) -> Self {
        if let TranslateRoute::Model { pivot: slot, .. } = &mut self.route {
            *slot = Some(pivot.into());
        }
        self
    }

    pub fn html(mut self, html: bool) -> Self {
        self.html = html;
        self
    }
}

#[derive(Debug, Deserialize)]
struct TranslateResponse {
    target: TranslatedText,
}

#[derive(Debug, Deserialize)]
struct TranslatedText {
    text: String,
}

/// One entry of a `ListModels` response, or a freshly downloaded model.
///
/// Missing fields default; fields this type does not name are kept in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ModelInfo {
    pub id: String,
    pub short_name: String,
    pub model_name: String,
    pub src: String,
    pub trg: String,
    /// Language tag -> display name for every source language.
    pub src_tags: BTreeMap<String, String>,
    pub trg_tag: String,
    #[serde(rename = "type")]
    pub model_type: String,
    pub repository: String,
    /// Installed on the peer's machine.
    pub local: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ModelInfo {
    pub fn translates(&self, src: &str, trg: &str) -> bool {
        self.src_tags.contains_key(src) && self.trg_tag == trg
    }
}

/// Download progress in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadProgress {
    pub read: u64,
    pub size: u64,
}

impl DownloadProgress {
    /// Completed fraction in `0.0..=1.0`; `None` while the size is unknown.
    pub fn fraction(&self) -> Option<f64> {
        (self.size > 0).then(|| self.read.min(self.size) as f64 / self.size as f64)
    }
}

/// Client wrapper exposing the peer's commands as methods.
pub struct TranslateLocally {
    client: Client,
}

impl TranslateLocally {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn into_inner(self) -> Client {
        self.client
    }

    /// Send any command without waiting for its response.
    pub async fn dispatch(
        &self,
        command: &Command,
        progress: ProgressSink,
    ) -> Result<ResponseHandle, ClientError> {
        tracing::trace!(command = command.name(), "Dispatching command");
        self.client
            .send_with_progress(command.name(), command.data()?, progress)
            .await
    }

    pub async fn list_models(&self, include_remote: bool) -> Result<Vec<ModelInfo>, ClientError> {
        let command = Command::ListModels { include_remote };
        self.client
            .request(command.name(), command.data()?)
            .await
    }

    /// Translated text.
    pub async fn translate(&self, request: TranslateRequest) -> Result<String, ClientError> {
        let command = Command::Translate(request);
        let response: TranslateResponse = self
            .client
            .request(command.name(), command.data()?)
            .await?;
        Ok(response.target.text)
    }

    /// Download a remote model; `on_progress` sees each update in order.
    pub async fn download_model(
        &self,
        model_id: impl Into<String>,
        on_progress: impl Fn(DownloadProgress) + Send + Sync + 'static,
    ) -> Result<ModelInfo, ClientError> {
        let command = Command::DownloadModel {
            model_id: model_id.into(),
        };
        let progress = ProgressSink::new(move |update| {
            match serde_json::from_value::<DownloadProgress>(update) {
                Ok(progress) => on_progress(progress),
                Err(e) => tracing::debug!(error = %e, "Ignoring unexpected progress shape"),
            }
        });
        self.client
            .request_with_progress(command.name(), command.data()?, progress)
            .await
    }
}
