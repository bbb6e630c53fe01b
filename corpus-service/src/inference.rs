//! Client for the model-serving inference service.
//!
//! Pipeline steps only see the [`Inference`] trait; [`HttpInference`] is the
//! production implementation and tests substitute an in-process fake.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::FutureExt;
use futures::future::BoxFuture;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::InferenceConfig;
use crate::error::{InferenceError, ServiceError, ServiceResult};

/// Result of language identification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageDetection {
    /// ISO 639-1 code
    pub language: String,
    pub confidence: f32,
}

/// A named-entity span inside one sentence. Offsets are character offsets
/// into that sentence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySpan {
    pub sentence_index: usize,
    pub begin: usize,
    pub end: usize,
    pub label: String,
    #[serde(default)]
    pub confidence: Option<f32>,
}

/// An object found in an image, in pixel coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    pub label: String,
    pub confidence: f32,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Speech-to-text result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    #[serde(default)]
    pub language: Option<String>,
}

/// Model operations used by pipeline steps
pub trait Inference: Send + Sync {
    fn detect_language<'a>(&'a self, text: &'a str)
    -> BoxFuture<'a, ServiceResult<LanguageDetection>>;

    fn annotate<'a>(
        &'a self,
        language: &'a str,
        sentences: &'a [String],
    ) -> BoxFuture<'a, ServiceResult<Vec<EntitySpan>>>;

    /// One vector per input, in input order
    fn embed<'a>(&'a self, inputs: &'a [String]) -> BoxFuture<'a, ServiceResult<Vec<Vec<f32>>>>;

    fn detect_objects<'a>(
        &'a self,
        image: &'a [u8],
    ) -> BoxFuture<'a, ServiceResult<Vec<DetectedObject>>>;

    /// Convert audio or video to mono PCM WAV suitable for transcription
    fn transcode<'a>(
        &'a self,
        media: &'a [u8],
        mime_type: &'a str,
    ) -> BoxFuture<'a, ServiceResult<Vec<u8>>>;

    fn transcribe<'a>(&'a self, audio: &'a [u8]) -> BoxFuture<'a, ServiceResult<Transcript>>;

    fn health_check(&self) -> BoxFuture<'_, bool>;
}

// ==================== Wire types ====================

#[derive(Serialize)]
struct LanguageRequest<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct AnnotateRequest<'a> {
    language: &'a str,
    sentences: &'a [String],
}

#[derive(Deserialize)]
struct AnnotateResponse {
    entities: Vec<EntitySpan>,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    inputs: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Serialize)]
struct ObjectsRequest {
    image_base64: String,
}

#[derive(Deserialize)]
struct ObjectsResponse {
    objects: Vec<DetectedObject>,
}

#[derive(Serialize)]
struct TranscodeRequest<'a> {
    media_base64: String,
    mime_type: &'a str,
    target: &'static str,
}

#[derive(Deserialize)]
struct TranscodeResponse {
    audio_base64: String,
}

#[derive(Serialize)]
struct TranscribeRequest {
    audio_base64: String,
}

// ==================== HTTP implementation ====================

/// Inference service client over HTTP/JSON
pub struct HttpInference {
    client: Client,
    base_url: String,
}

impl HttpInference {
    pub fn new(config: &InferenceConfig) -> ServiceResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| {
                ServiceError::Inference(InferenceError::Connection {
                    url: config.base_url.clone(),
                    source: e,
                })
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post<Req, Resp>(&self, path: &str, request: &Req) -> ServiceResult<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "Inference request");

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| InferenceError::Connection {
                url: url.clone(),
                source: e,
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ServiceError::Inference(InferenceError::Status {
                status: status.as_u16(),
                message,
            }));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| InferenceError::Connection {
                url: url.clone(),
                source: e,
            })?;

        let parsed = serde_json::from_slice(&body)
            .map_err(|e| InferenceError::InvalidResponse { source: e })?;

        Ok(parsed)
    }
}

fn decode_base64(encoded: &str) -> ServiceResult<Vec<u8>> {
    BASE64.decode(encoded).map_err(|e| {
        ServiceError::Inference(InferenceError::InvalidResponse {
            source: serde_json::Error::io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                e.to_string(),
            )),
        })
    })
}

impl Inference for HttpInference {
    fn detect_language<'a>(
        &'a self,
        text: &'a str,
    ) -> BoxFuture<'a, ServiceResult<LanguageDetection>> {
        async move { self.post("/v1/language", &LanguageRequest { text }).await }.boxed()
    }

    fn annotate<'a>(
        &'a self,
        language: &'a str,
        sentences: &'a [String],
    ) -> BoxFuture<'a, ServiceResult<Vec<EntitySpan>>> {
        async move {
            let response: AnnotateResponse = self
                .post("/v1/annotate", &AnnotateRequest { language, sentences })
                .await?;
            Ok(response.entities)
        }
        .boxed()
    }

    fn embed<'a>(&'a self, inputs: &'a [String]) -> BoxFuture<'a, ServiceResult<Vec<Vec<f32>>>> {
        async move {
            let response: EmbedResponse = self.post("/v1/embed", &EmbedRequest { inputs }).await?;
            if response.embeddings.len() != inputs.len() {
                return Err(ServiceError::Inference(InferenceError::Status {
                    status: 502,
                    message: format!(
                        "expected {} embeddings, got {}",
                        inputs.len(),
                        response.embeddings.len()
                    ),
                }));
            }
            Ok(response.embeddings)
        }
        .boxed()
    }

    fn detect_objects<'a>(
        &'a self,
        image: &'a [u8],
    ) -> BoxFuture<'a, ServiceResult<Vec<DetectedObject>>> {
        async move {
            let request = ObjectsRequest {
                image_base64: BASE64.encode(image),
            };
            let response: ObjectsResponse = self.post("/v1/objects", &request).await?;
            Ok(response.objects)
        }
        .boxed()
    }

    fn transcode<'a>(
        &'a self,
        media: &'a [u8],
        mime_type: &'a str,
    ) -> BoxFuture<'a, ServiceResult<Vec<u8>>> {
        async move {
            let request = TranscodeRequest {
                media_base64: BASE64.encode(media),
                mime_type,
                target: "audio/wav",
            };
            let response: TranscodeResponse = self.post("/v1/transcode", &request).await?;
            decode_base64(&response.audio_base64)
        }
        .boxed()
    }

    fn transcribe<'a>(&'a self, audio: &'a [u8]) -> BoxFuture<'a, ServiceResult<Transcript>> {
        async move {
            let request = TranscribeRequest {
                audio_base64: BASE64.encode(audio),
            };
            self.post("/v1/transcribe", &request).await
        }
        .boxed()
    }

    fn health_check(&self) -> BoxFuture<'_, bool> {
        async move {
            let url = format!("{}/health", self.base_url);
            match self.client.get(&url).send().await {
                Ok(resp) => resp.status().is_success(),
                Err(e) => {
                    warn!(error = %e, "Inference health check failed");
                    false
                }
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_span_confidence_is_optional() {
        let span: EntitySpan = serde_json::from_str(
            r#"{"sentence_index": 1, "begin": 0, "end": 4, "label": "PERSON"}"#,
        )
        .unwrap();
        assert_eq!(span.confidence, None);
        assert_eq!(span.label, "PERSON");
    }

    #[test]
    fn test_invalid_base64_is_invalid_response() {
        let err = decode_base64("not base64!").unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Inference(InferenceError::InvalidResponse { .. })
        ));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_base_url_is_normalized() {
        let client = HttpInference::new(&InferenceConfig {
            base_url: "http://models:9000/".to_string(),
            request_timeout_secs: 5,
        })
        .unwrap();
        assert_eq!(client.base_url, "http://models:9000");
    }
}
