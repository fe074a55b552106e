//! USDA FoodData Central lookups for detected classes.

use crate::config::NutritionConfig;
use futures::{stream, StreamExt};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize, Serializer};
use std::{collections::BTreeMap, time::Duration};
use thiserror::Error;
use tokio::time::sleep;
use tracing::instrument;

pub const CALORIES_NUTRIENT_ID: u32 = 208;
pub const PROTEIN_NUTRIENT_ID: u32 = 203;
pub const CARBS_NUTRIENT_ID: u32 = 205;
pub const FAT_NUTRIENT_ID: u32 = 204;

#[derive(Error, Debug)]
pub enum NutritionError {
    #[error("Nutrition request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Nutrition API returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("Failed to build HTTP client: {0}")]
    Client(String),
}

impl NutritionError {
    fn is_retryable(&self) -> bool {
        match self {
            NutritionError::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            NutritionError::Status { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS.as_u16() || *status >= 500
            }
            NutritionError::Client(_) => false,
        }
    }
}

/// A nutrient amount, or `"Unknown"` when the record does not carry it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NutrientValue {
    Amount(f64),
    Unknown,
}

impl Serialize for NutrientValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            NutrientValue::Amount(value) => serializer.serialize_f64(*value),
            NutrientValue::Unknown => serializer.serialize_str("Unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NutritionRecord {
    pub calories: NutrientValue,
    pub protein: NutrientValue,
    pub carbs: NutrientValue,
    pub fat: NutrientValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NutritionLookup {
    Found(NutritionRecord),
    NotFound,
}

#[derive(Debug, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    foods: Vec<Food>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Food {
    #[serde(default)]
    food_nutrients: Vec<FoodNutrient>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FoodNutrient {
    nutrient_id: Option<u32>,
    value: Option<f64>,
}

fn find_nutrient(nutrients: &[FoodNutrient], id: u32) -> NutrientValue {
    nutrients
        .iter()
        .find(|nutrient| nutrient.nutrient_id == Some(id))
        .and_then(|nutrient| nutrient.value)
        .map(NutrientValue::Amount)
        .unwrap_or(NutrientValue::Unknown)
}

/// Reads the four tracked nutrients from the first matching food.
pub fn extract_record(response: &SearchResponse) -> NutritionLookup {
    match response.foods.first() {
        Some(food) => NutritionLookup::Found(NutritionRecord {
            calories: find_nutrient(&food.food_nutrients, CALORIES_NUTRIENT_ID),
            protein: find_nutrient(&food.food_nutrients, PROTEIN_NUTRIENT_ID),
            carbs: find_nutrient(&food.food_nutrients, CARBS_NUTRIENT_ID),
            fat: find_nutrient(&food.food_nutrients, FAT_NUTRIENT_ID),
        }),
        None => NutritionLookup::NotFound,
    }
}

#[derive(Clone)]
pub struct NutritionClient {
    client: Client,
    search_url: String,
    api_key: String,
    max_retries: u32,
    initial_backoff: Duration,
    max_concurrency: usize,
}

impl NutritionClient {
    pub fn new(config: &NutritionConfig) -> Result<Self, NutritionError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| NutritionError::Client(e.to_string()))?;

        Ok(Self {
            client,
            search_url: config.search_url.clone(),
            api_key: config.api_key.clone(),
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_concurrency: config.max_concurrency.max(1),
        })
    }

    async fn search(&self, food_name: &str) -> Result<NutritionLookup, NutritionError> {
        let response = self
            .client
            .get(&self.search_url)
            .query(&[("query", food_name), ("api_key", self.api_key.as_str())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(NutritionError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let data: SearchResponse = response.json().await?;
        Ok(extract_record(&data))
    }

    /// Looks up one food, retrying transient failures with jittered
    /// exponential backoff.
    #[instrument(skip(self))]
    pub async fn lookup(&self, food_name: &str) -> Result<NutritionLookup, NutritionError> {
        let mut retry_delay = self.initial_backoff;
        let mut attempt = 0;

        loop {
            match self.search(food_name).await {
                Ok(lookup) => return Ok(lookup),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        "Nutrition lookup failed, retrying (attempt {}/{}): {}",
                        attempt,
                        self.max_retries,
                        e
                    );
                    let jitter = rand::random::<f32>() * 0.2 + 0.9;
                    sleep(retry_delay.mul_f32(jitter)).await;
                    retry_delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Fans out over `food_names` with bounded concurrency. Foods without a
    /// record, or whose lookup failed, are left out of the map.
    pub async fn lookup_many(&self, food_names: &[String]) -> BTreeMap<String, NutritionRecord> {
        stream::iter(food_names)
            .map(|name| async move { (name, self.lookup(name).await) })
            .buffer_unordered(self.max_concurrency)
            .boxed()
            .filter_map(|(name, result)| async move {
                match result {
                    Ok(NutritionLookup::Found(record)) => Some((name.clone(), record)),
                    Ok(NutritionLookup::NotFound) => {
                        tracing::info!("No nutrition record for {}", name);
                        None
                    }
                    Err(e) => {
                        tracing::error!("Nutrition lookup for {} failed: {}", name, e);
                        None
                    }
                }
            })
            .collect()
            .await
    }
}
