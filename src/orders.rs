// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sales orders on top of the record store.
//!
//! Orders are keyed by their creation time as a millisecond RFC 3339
//! timestamp (`2024-01-01T00:00:00.000Z`), so key order is creation order and
//! [`OrderBook::list`] can return newest first with a descending scan.

use crate::error::{Result, SyncError};
use crate::revision::{Body, Revision};
use crate::store::{DocumentRow, RecordStore};
use chrono::{DateTime, SecondsFormat, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

/// One sales order as entered on the order form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SalesOrder {
    pub order_id: String,
    pub order_date: String,
    pub customer: String,
    pub customer_id: String,
    pub material_code: String,
    pub material_desc: String,
    pub quantity: i64,
    pub unit_price: f64,
    pub currency: String,
    pub sales_org: String,
    pub dist_channel: String,
    pub division: String,
    pub status: String,
}

impl SalesOrder {
    pub fn to_body(&self) -> Result<Body> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(SyncError::Encoding(format!(
                "order serialized to non-object: {}",
                other
            ))),
        }
    }

    pub fn from_body(body: Body) -> Result<Self> {
        Ok(serde_json::from_value(Value::Object(body))?)
    }
}

/// A stored order with its key and revision.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredOrder {
    pub key: String,
    pub rev: Revision,
    pub order: SalesOrder,
}

/// Key for an order created at `at`.
pub fn order_key(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub struct OrderBook {
    store: Arc<RecordStore>,
}

impl OrderBook {
    pub fn new(store: Arc<RecordStore>) -> Self {
        Self { store }
    }

    /// Store a new order keyed by the current time.
    pub async fn create(&self, order: &SalesOrder) -> Result<StoredOrder> {
        self.create_at(Utc::now(), order).await
    }

    /// Store a new order keyed by `at`. Fails `Conflict` if an order already
    /// exists under that timestamp.
    pub async fn create_at(&self, at: DateTime<Utc>, order: &SalesOrder) -> Result<StoredOrder> {
        let key = order_key(at);
        let rev = self.store.create(&key, order.to_body()?).await?;
        info!(key = %key, order_id = %order.order_id, rev = %rev, "Order created");
        Ok(StoredOrder {
            key,
            rev,
            order: order.clone(),
        })
    }

    pub async fn get(&self, key: &str) -> Result<StoredOrder> {
        let doc = self.store.get(key, None).await?;
        Ok(StoredOrder {
            key: doc.key,
            rev: doc.rev,
            order: SalesOrder::from_body(doc.body)?,
        })
    }

    /// All live orders, newest first. Documents that do not decode as an
    /// order are logged and left out.
    pub async fn list(&self) -> Result<Vec<StoredOrder>> {
        let rows: Vec<DocumentRow> = self
            .store
            .all_documents(true, true)
            .await?
            .try_collect()
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|DocumentRow { key, rev, body }| {
                match SalesOrder::from_body(body.unwrap_or_default()) {
                    Ok(order) => Some(StoredOrder { key, rev, order }),
                    Err(e) => {
                        warn!(key = %key, error = %e, "Skipping document that is not an order");
                        None
                    }
                }
            })
            .collect())
    }
}
