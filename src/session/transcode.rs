//! Cross-language value transcoding
//!
//! Triggered when a function's language differs from an argument's
//! encoding; mismatched values are normalised to JSON. The transcoder
//! is an injected capability: the shipping realisation shells out to
//! helper commands (a Python helper for pickle, a configurable helper
//! for gob), an in-process library would be another realisation.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{FabricError, Result};
use crate::store::{EncodedObject, Language};

/// Python snippet turning pickle bytes on stdin into JSON on stdout.
const PICKLE_TO_JSON: &str =
    "import sys, json, cloudpickle; sys.stdout.write(json.dumps(cloudpickle.loads(sys.stdin.buffer.read()), default=str))";

/// The transcoding capability
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Re-encode `object` for a consumer in `target`. Same-language
    /// calls are identity.
    async fn transcode(&self, object: &EncodedObject, target: Language) -> Result<EncodedObject>;
}

/// Helper-command transcoder
pub struct ProcessTranscoder {
    python_helper: Vec<String>,
    gob_helper: Option<Vec<String>>,
}

impl Default for ProcessTranscoder {
    fn default() -> Self {
        Self {
            python_helper: vec!["python3".to_string(), "-c".to_string(), PICKLE_TO_JSON.to_string()],
            gob_helper: None,
        }
    }
}

impl ProcessTranscoder {
    /// Default helpers: `python3` for pickle, no gob helper.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the pickle helper command.
    pub fn with_python_helper(mut self, helper: Vec<String>) -> Self {
        self.python_helper = helper;
        self
    }

    /// Configure a gob→JSON helper command.
    pub fn with_gob_helper(mut self, helper: Vec<String>) -> Self {
        self.gob_helper = Some(helper);
        self
    }

    async fn run_helper(&self, helper: &[String], input: &[u8]) -> Result<Vec<u8>> {
        let program = helper
            .first()
            .ok_or_else(|| FabricError::not_configured("empty transcoder helper"))?;
        let mut child = Command::new(program)
            .args(&helper[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| FabricError::internal(format!("spawn {program}: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| FabricError::internal("helper stdin unavailable"))?;
        stdin
            .write_all(input)
            .await
            .map_err(|e| FabricError::internal(format!("write helper stdin: {e}")))?;
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| FabricError::internal(format!("wait for {program}: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FabricError::internal(format!(
                "{program} exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl Transcoder for ProcessTranscoder {
    async fn transcode(&self, object: &EncodedObject, target: Language) -> Result<EncodedObject> {
        if object.language == target {
            return Ok(object.clone());
        }

        let (data, helper_name) = match (object.language, target) {
            (Language::Python, Language::Json) => {
                (self.run_helper(&self.python_helper, &object.data).await?, "pickle")
            }
            (Language::Go, Language::Json) => match &self.gob_helper {
                Some(helper) => (self.run_helper(helper, &object.data).await?, "gob"),
                None => {
                    return Err(FabricError::unsupported("gob transcoding without a helper"));
                }
            },
            (from, to) => {
                return Err(FabricError::unsupported(format!("transcode {from} to {to}")));
            }
        };

        tracing::debug!(object = %object.id, helper = helper_name, "object transcoded");
        Ok(EncodedObject {
            id: object.id.clone(),
            data,
            language: Language::Json,
            is_stream: object.is_stream,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(language: Language, data: &[u8]) -> EncodedObject {
        EncodedObject { id: "o1".to_string(), data: data.to_vec(), language, is_stream: false }
    }

    #[tokio::test]
    async fn same_language_is_identity() {
        let transcoder = ProcessTranscoder::new();
        let obj = object(Language::Json, b"{\"x\":1}");
        let out = transcoder.transcode(&obj, Language::Json).await.unwrap();
        assert_eq!(out, obj);
    }

    #[tokio::test]
    async fn pickle_helper_output_becomes_json() {
        // `cat` stands in for the Python helper: bytes pass through,
        // the encoding label flips to JSON.
        let transcoder = ProcessTranscoder::new().with_python_helper(vec!["cat".to_string()]);
        let obj = object(Language::Python, b"payload");
        let out = transcoder.transcode(&obj, Language::Json).await.unwrap();
        assert_eq!(out.data, b"payload");
        assert_eq!(out.language, Language::Json);
    }

    #[tokio::test]
    async fn gob_without_helper_is_unsupported() {
        let transcoder = ProcessTranscoder::new();
        let err = transcoder.transcode(&object(Language::Go, b"x"), Language::Json).await.unwrap_err();
        assert!(matches!(err, FabricError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn helper_failures_surface_as_typed_errors() {
        let transcoder =
            ProcessTranscoder::new().with_python_helper(vec!["false".to_string()]);
        let err = transcoder
            .transcode(&object(Language::Python, b"x"), Language::Json)
            .await
            .unwrap_err();
        assert!(matches!(err, FabricError::Internal { .. }));
    }

    #[tokio::test]
    async fn unsupported_pairs_are_rejected() {
        let transcoder = ProcessTranscoder::new();
        let err = transcoder
            .transcode(&object(Language::Json, b"{}"), Language::Python)
            .await
            .unwrap_err();
        assert!(matches!(err, FabricError::Unsupported { .. }));
    }
}
