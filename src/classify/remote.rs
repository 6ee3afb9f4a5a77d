//! Remote intent classifier.
//!
//! Posts `{text, intents, context}` to the configured endpoint and expects
//! `{intent, confidence, slots}` back. Any transport or contract failure
//! falls back to the deterministic pattern classifier for the same request,
//! so classification never fails.

use super::pattern::PatternClassifier;
use super::{Classifier, Intent};
use crate::flow::IntentDef;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct RemoteClassifier {
    client: Client,
    url: String,
    api_key: String,
    fallback: PatternClassifier,
}

#[derive(Serialize)]
struct ClassifyRequest<'a> {
    text: &'a str,
    intents: &'a BTreeMap<String, IntentDef>,
    context: &'a Value,
}

#[derive(Deserialize)]
struct ClassifyResponse {
    intent: String,
    confidence: f64,
    #[serde(default)]
    slots: Value,
}

impl RemoteClassifier {
    pub fn new(url: String, api_key: String) -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to create HTTP client");
        Self {
            client,
            url,
            api_key,
            fallback: PatternClassifier::new(),
        }
    }

    async fn try_remote(
        &self,
        text: &str,
        intents: &BTreeMap<String, IntentDef>,
        context: &Value,
    ) -> Result<Intent, reqwest::Error> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&ClassifyRequest {
                text,
                intents,
                context,
            })
            .send()
            .await?
            .error_for_status()?
            .json::<ClassifyResponse>()
            .await?;

        Ok(Intent::new(
            response.intent,
            response.confidence,
            response.slots,
        ))
    }
}

#[async_trait]
impl Classifier for RemoteClassifier {
    async fn classify(
        &self,
        text: &str,
        intents: &BTreeMap<String, IntentDef>,
        context: &Value,
    ) -> Intent {
        match self.try_remote(text, intents, context).await {
            Ok(intent) if intents.contains_key(&intent.name) => intent,
            Ok(intent) => {
                tracing::warn!(
                    intent = %intent.name,
                    "remote classifier returned an intent outside the catalog, falling back"
                );
                self.fallback.classify(text, intents, context).await
            }
            Err(err) => {
                tracing::warn!(error = %err, "remote classifier failed, falling back");
                self.fallback.classify(text, intents, context).await
            }
        }
    }
}
