use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use reqwest::{
    Client,
    multipart::{Form, Part},
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    Error, Result,
    config::{env_var, opt_from_file_const_or_env},
    models::{BoundingBox, Frame, Prediction},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all(deserialize = "kebab-case"))]
pub struct Config {
    #[serde(default = "default_app_url")]
    pub app_url: String,
    #[serde(default = "default_api_key", deserialize_with = "opt_from_file_const_or_env")]
    pub api_key: Option<String>,
    #[serde(default = "default_endpoint_id")]
    pub endpoint_id: Option<String>,
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub timeout: Duration,
}

fn default_app_url() -> String {
    env_var("LANDINGAI_APP_URL").unwrap_or_else(|| "https://predict.app.landing.ai".to_string())
}

fn default_api_key() -> Option<String> {
    env_var("LANDINGLENS_API_KEY")
}

fn default_endpoint_id() -> Option<String> {
    env_var("LANDINGLENS_ENDPOINT_ID")
}

fn default_timeout() -> Duration {
    Duration::from_secs(60)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_url: default_app_url(),
            api_key: default_api_key(),
            endpoint_id: default_endpoint_id(),
            timeout: default_timeout(),
        }
    }
}

#[async_trait]
pub trait Scorer: Send + Sync {
    fn endpoint_id(&self) -> &str;

    async fn predict(&self, frame: &Frame) -> Result<Vec<Prediction>>;
}

pub struct LandingLensScorer {
    client: Client,
    config: Config,
}

impl LandingLensScorer {
    pub fn new(config: Config) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    fn configured_endpoint(&self) -> Result<&str> {
        self.config
            .endpoint_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::Config("scoring endpoint id is not configured".to_string()))
    }

    fn configured_api_key(&self) -> Result<&str> {
        self.config
            .api_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| Error::Config("scoring api key is not configured".to_string()))
    }
}

#[async_trait]
impl Scorer for LandingLensScorer {
    fn endpoint_id(&self) -> &str {
        self.config.endpoint_id.as_deref().unwrap_or_default()
    }

    #[tracing::instrument(skip(self, frame), fields(frame = %frame.filename()))]
    async fn predict(&self, frame: &Frame) -> Result<Vec<Prediction>> {
        let endpoint_id = self.configured_endpoint()?;
        let api_key = self.configured_api_key()?;
        let image = tokio::fs::read(&frame.path).await?;

        let part = Part::bytes(image)
            .file_name(frame.filename())
            .mime_str("image/jpeg")?;
        let url = format!(
            "{}/inference/v1/predict",
            self.config.app_url.trim_end_matches('/')
        );

        let response = self
            .client
            .post(url)
            .query(&[("endpoint_id", endpoint_id)])
            .header("apikey", api_key)
            .multipart(Form::new().part("file", part))
            .send()
            .await
            .map_err(|e| Error::Scoring(format!("Inference request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Scoring(format!("Inference endpoint returned {status}: {body}")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| Error::Scoring(format!("Failed to read inference response: {e}")))?;
        let predictions = parse_predictions(&body, &frame.filename())?;
        debug!(predictions = predictions.len(), "Scored frame");

        Ok(predictions)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPrediction {
    score: f64,
    label_index: i64,
    label_name: String,
    #[serde(default)]
    coordinates: Option<RawCoordinates>,
}

#[derive(Deserialize)]
struct RawCoordinates {
    xmin: f64,
    ymin: f64,
    xmax: f64,
    ymax: f64,
}

#[derive(Deserialize)]
struct RawResponse {
    #[serde(default)]
    backbonepredictions: Option<BTreeMap<String, RawPrediction>>,
    #[serde(default)]
    predictions: Option<RawPrediction>,
}

/// Reads an inference response. Object detection results are keyed by
/// prediction id; a classification result has no id, so one is derived from
/// the frame name.
pub fn parse_predictions(body: &str, frame_name: &str) -> Result<Vec<Prediction>> {
    let response: RawResponse = serde_json::from_str(body)
        .map_err(|e| Error::Scoring(format!("Unrecognised inference response: {e}")))?;

    if let Some(detections) = response.backbonepredictions {
        return Ok(detections
            .into_iter()
            .map(|(id, raw)| prediction(id, raw))
            .collect());
    }

    Ok(response
        .predictions
        .map(|raw| {
            let id = format!("{frame_name}#{}", raw.label_index);
            vec![prediction(id, raw)]
        })
        .unwrap_or_default())
}

fn prediction(id: String, raw: RawPrediction) -> Prediction {
    Prediction {
        id,
        label_name: raw.label_name,
        label_index: raw.label_index,
        score: raw.score,
        bboxes: raw
            .coordinates
            .map(|c| BoundingBox([c.xmin, c.ymin, c.xmax, c.ymax])),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_object_detection_response() {
        let body = r#"{
            "backbonetype": null,
            "type": "ObjectDetectionPrediction",
            "backbonepredictions": {
                "b-2": {
                    "score": 0.61,
                    "defect_id": 7,
                    "labelIndex": 2,
                    "labelName": "squirrel",
                    "coordinates": {"xmin": 5, "ymin": 6, "xmax": 50, "ymax": 60}
                },
                "a-1": {
                    "score": 0.93,
                    "defect_id": 3,
                    "labelIndex": 1,
                    "labelName": "robin",
                    "coordinates": {"xmin": 10, "ymin": 20, "xmax": 110, "ymax": 220}
                }
            }
        }"#;

        let predictions = parse_predictions(body, "frame_0.jpg").unwrap();

        assert_eq!(
            predictions,
            vec![
                Prediction {
                    id: "a-1".into(),
                    label_name: "robin".into(),
                    label_index: 1,
                    score: 0.93,
                    bboxes: Some(BoundingBox([10.0, 20.0, 110.0, 220.0])),
                },
                Prediction {
                    id: "b-2".into(),
                    label_name: "squirrel".into(),
                    label_index: 2,
                    score: 0.61,
                    bboxes: Some(BoundingBox([5.0, 6.0, 50.0, 60.0])),
                },
            ]
        );
    }

    #[test]
    fn test_parse_classification_response() {
        let body = r#"{
            "type": "ClassificationPrediction",
            "predictions": {"score": 0.88, "labelIndex": 0, "labelName": "empty"}
        }"#;

        let predictions = parse_predictions(body, "frame_3.jpg").unwrap();

        assert_eq!(predictions.len(), 1);
        assert_eq!(predictions[0].id, "frame_3.jpg#0");
        assert_eq!(predictions[0].label_name, "empty");
        assert_eq!(predictions[0].bboxes, None);
    }

    #[test]
    fn test_parse_empty_and_invalid_responses() {
        assert!(
            parse_predictions(r#"{"backbonepredictions": {}}"#, "f.jpg")
                .unwrap()
                .is_empty()
        );
        assert!(parse_predictions("{}", "f.jpg").unwrap().is_empty());
        assert!(matches!(
            parse_predictions("<html>", "f.jpg"),
            Err(Error::Scoring(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_endpoint_is_a_config_error() {
        let scorer = LandingLensScorer::new(Config {
            endpoint_id: None,
            ..Config::default()
        })
        .unwrap();
        let frame = Frame {
            path: "does-not-matter.jpg".into(),
            event_id: "777".into(),
            captured_at: chrono::Utc::now(),
            index: 0,
        };

        let err = scorer.predict(&frame).await.err().unwrap();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_missing_api_key_is_a_config_error() {
        let scorer = LandingLensScorer::new(Config {
            endpoint_id: Some("endpoint-1".into()),
            api_key: None,
            ..Config::default()
        })
        .unwrap();
        let frame = Frame {
            path: "does-not-matter.jpg".into(),
            event_id: "777".into(),
            captured_at: chrono::Utc::now(),
            index: 0,
        };

        let err = scorer.predict(&frame).await.err().unwrap();
        assert!(matches!(err, Error::Config(ref message) if message.contains("api key")));
    }
}
