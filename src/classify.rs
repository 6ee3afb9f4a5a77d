//! Intent classification port.
//!
//! The engine only depends on the [`Classifier`] trait: user text, the
//! flow's intent catalog and the current context in, a named intent with a
//! confidence and typed slots out. Low confidence is a valid output — only
//! transition guards decide what happens with it.

pub mod pattern;
pub mod remote;

use crate::flow::IntentDef;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A classified user utterance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub name: String,
    pub confidence: f64,
    #[serde(default)]
    pub slots: Value,
}

impl Intent {
    pub fn new(name: impl Into<String>, confidence: f64, slots: Value) -> Self {
        Self {
            name: name.into(),
            confidence: confidence.clamp(0.0, 1.0),
            slots,
        }
    }
}

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(
        &self,
        text: &str,
        intents: &BTreeMap<String, IntentDef>,
        context: &Value,
    ) -> Intent;
}

#[async_trait]
impl<T: Classifier + ?Sized> Classifier for Arc<T> {
    async fn classify(
        &self,
        text: &str,
        intents: &BTreeMap<String, IntentDef>,
        context: &Value,
    ) -> Intent {
        (**self).classify(text, intents, context).await
    }
}

/// Remote classifier credentials. When incomplete, the deterministic
/// pattern classifier serves every request.
#[derive(Debug, Clone, Default)]
pub struct ClassifierConfig {
    pub url: Option<String>,
    pub api_key: Option<String>,
}

impl ClassifierConfig {
    pub fn from_env() -> Self {
        Self {
            url: std::env::var("SWITCHBOARD_CLASSIFIER_URL").ok(),
            api_key: std::env::var("SWITCHBOARD_CLASSIFIER_API_KEY").ok(),
        }
    }

    /// Build the configured classifier.
    pub fn build(&self) -> Arc<dyn Classifier> {
        match (&self.url, &self.api_key) {
            (Some(url), Some(api_key)) => {
                tracing::info!(%url, "using remote intent classifier");
                Arc::new(remote::RemoteClassifier::new(url.clone(), api_key.clone()))
            }
            _ => {
                tracing::info!("no classifier credentials, using pattern classifier");
                Arc::new(pattern::PatternClassifier::new())
            }
        }
    }
}
