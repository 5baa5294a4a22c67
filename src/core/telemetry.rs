//! Bucketed traffic analytics on top of a [`KeyValueStore`].
//!
//! Every bucket is a handful of sibling keys sharing the prefix
//! `Analytics:{service}:{retention}:{bucket}`; counters are plain integers and the
//! distributions (country, ip, resource, response code) are hashes. Buckets are never
//! rotated: each increment refreshes the key's absolute expiry and the store drops
//! them once they fall out of the retention window.
use std::{
    collections::{BTreeMap, HashMap},
    net::IpAddr,
    sync::Arc,
};

use chrono::{DateTime, Utc};
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    core::timescale::{TimeScale, canonical_timestamp},
    ports::kv_store::{KeyValueStore, StoreResult},
};

/// Sub-key names of one analytics bucket.
pub mod field {
    pub const QUANTITY: &str = "quantity";
    pub const RECEIVED_BYTES: &str = "received_bytes";
    pub const SENT_BYTES: &str = "sent_bytes";
    pub const COUNTRY: &str = "country";
    pub const IP: &str = "ip";
    pub const RESOURCE: &str = "resource";
    pub const RESPONSE_CODE: &str = "response_code";

    pub const ALL: [&str; 7] = [
        QUANTITY,
        RECEIVED_BYTES,
        SENT_BYTES,
        COUNTRY,
        IP,
        RESOURCE,
        RESPONSE_CODE,
    ];
}

/// Value recorded when no header identifies the client's country or address.
pub const UNKNOWN_ORIGIN: &str = "unknown";

/// Store key of one bucket field.
pub fn analytics_key(service_id: &str, scale: TimeScale, bucket: &str, field: &str) -> String {
    format!(
        "Analytics:{}:{}:{}:{}",
        service_id,
        scale.retention(),
        bucket,
        field
    )
}

/// Aggregate for one (service, scale, bucket).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyticsBucket {
    pub quantity: u64,
    pub received_bytes: u64,
    pub sent_bytes: u64,
    pub country: BTreeMap<String, u64>,
    pub ip: BTreeMap<String, u64>,
    pub resource: BTreeMap<String, u64>,
    pub response_code: BTreeMap<u16, u64>,
}

/// One observed exchange, as fed to [`TelemetryStore::record`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficRecord {
    pub service_id: String,
    pub resource: String,
    pub country: String,
    pub ip: String,
    pub response_code: u16,
    pub received_bytes: u64,
    pub sent_bytes: u64,
}

/// Where a request came from, as far as the inbound headers tell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientOrigin {
    pub country: Option<String>,
    pub ip: Option<String>,
}

/// Header names trusted to carry the client's origin. Unset names fall back to the
/// name-based heuristic.
#[derive(Debug, Clone, Default)]
pub struct OriginHeaders {
    pub country: Option<String>,
    pub client_ip: Option<String>,
}

impl ClientOrigin {
    /// Scan `headers` once for the client's country and address.
    ///
    /// With a trusted header configured only that header is consulted. Otherwise any
    /// header whose name contains `country` sets the country, and `x-forwarded-for` or
    /// any name ending in `ip` sets the address; headers are visited in arrival order
    /// and the last match wins.
    pub fn from_headers(headers: &HeaderMap, trusted: &OriginHeaders) -> Self {
        let mut origin = ClientOrigin::default();

        if let Some(name) = &trusted.country {
            origin.country = header_str(headers, name).map(str::to_string);
        }
        if let Some(name) = &trusted.client_ip {
            origin.ip = header_str(headers, name).map(client_from_forwarded);
        }

        for (name, value) in headers {
            let Ok(value) = value.to_str() else {
                continue;
            };
            let name = name.as_str();
            if trusted.country.is_none() && name.contains("country") {
                origin.country = Some(value.trim().to_string());
            } else if trusted.client_ip.is_none()
                && (name == "x-forwarded-for" || name.ends_with("ip"))
            {
                origin.ip = Some(client_from_forwarded(value));
            }
        }

        origin.country = origin.country.filter(|v| !v.is_empty());
        origin.ip = origin.ip.filter(|v| !v.is_empty());
        origin
    }

    /// Fill the address from the socket peer when no header supplied one.
    pub fn or_peer(mut self, peer: Option<IpAddr>) -> Self {
        if self.ip.is_none() {
            self.ip = peer.map(|addr| addr.to_string());
        }
        self
    }

    pub fn country_or_unknown(&self) -> String {
        self.country
            .clone()
            .unwrap_or_else(|| UNKNOWN_ORIGIN.to_string())
    }

    pub fn ip_or_unknown(&self) -> String {
        self.ip.clone().unwrap_or_else(|| UNKNOWN_ORIGIN.to_string())
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

// `X-Forwarded-For: client, proxy1, proxy2`
fn client_from_forwarded(value: &str) -> String {
    value.split(',').next().unwrap_or_default().trim().to_string()
}

/// Analytics operations over an injected key-value store.
#[derive(Clone)]
pub struct TelemetryStore {
    store: Arc<dyn KeyValueStore>,
}

impl TelemetryStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Count one exchange into the current bucket of every scale.
    ///
    /// Best-effort: a failing write is logged and abandons the rest of that scale
    /// only. Returns how many scales were fully written.
    pub async fn record(&self, record: &TrafficRecord) -> usize {
        self.record_at(record, Utc::now()).await
    }

    pub async fn record_at(&self, record: &TrafficRecord, now: DateTime<Utc>) -> usize {
        let mut written = 0;
        for scale in TimeScale::ALL {
            match self.record_scale(record, scale, now).await {
                Ok(()) => written += 1,
                Err(e) => warn!(
                    "Failed to record analytics for service {} on {} scale: {}",
                    record.service_id, scale, e
                ),
            }
        }
        written
    }

    async fn record_scale(
        &self,
        record: &TrafficRecord,
        scale: TimeScale,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let bucket = canonical_timestamp(scale.bucket_start(now, 0));
        let expire_at = scale.expiry(now);
        let key = |f: &str| analytics_key(&record.service_id, scale, &bucket, f);

        self.store
            .increment(&key(field::QUANTITY), 1, expire_at)
            .await?;
        self.store
            .increment(
                &key(field::RECEIVED_BYTES),
                saturating_i64(record.received_bytes),
                expire_at,
            )
            .await?;
        self.store
            .increment(
                &key(field::SENT_BYTES),
                saturating_i64(record.sent_bytes),
                expire_at,
            )
            .await?;
        self.store
            .hash_increment(&key(field::COUNTRY), &record.country, 1, expire_at)
            .await?;
        self.store
            .hash_increment(&key(field::IP), &record.ip, 1, expire_at)
            .await?;
        self.store
            .hash_increment(&key(field::RESOURCE), &record.resource, 1, expire_at)
            .await?;
        self.store
            .hash_increment(
                &key(field::RESPONSE_CODE),
                &record.response_code.to_string(),
                1,
                expire_at,
            )
            .await?;
        Ok(())
    }

    /// Every live bucket of `scale` for a service, keyed by canonical timestamp.
    /// Buckets without traffic are absent from the result.
    pub async fn query(
        &self,
        service_id: &str,
        scale: TimeScale,
    ) -> StoreResult<BTreeMap<String, AnalyticsBucket>> {
        self.query_at(service_id, scale, Utc::now()).await
    }

    pub async fn query_at(
        &self,
        service_id: &str,
        scale: TimeScale,
        now: DateTime<Utc>,
    ) -> StoreResult<BTreeMap<String, AnalyticsBucket>> {
        let mut buckets = BTreeMap::new();
        for offset in 0..scale.retention() {
            let bucket = canonical_timestamp(scale.bucket_start(now, -offset));
            if let Some(data) = self.read_bucket(service_id, scale, &bucket).await? {
                buckets.insert(bucket, data);
            }
        }
        Ok(buckets)
    }

    async fn read_bucket(
        &self,
        service_id: &str,
        scale: TimeScale,
        bucket: &str,
    ) -> StoreResult<Option<AnalyticsBucket>> {
        let key = |f: &str| analytics_key(service_id, scale, bucket, f);

        let quantity_key = key(field::QUANTITY);
        let Some(raw) = self.store.get(&quantity_key).await? else {
            return Ok(None);
        };
        let Ok(quantity) = raw.parse::<u64>() else {
            debug!("Skipping bucket {} with unreadable quantity {:?}", quantity_key, raw);
            return Ok(None);
        };

        let counter = |raw: Option<String>| raw.and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);
        let received_bytes = counter(self.store.get(&key(field::RECEIVED_BYTES)).await?);
        let sent_bytes = counter(self.store.get(&key(field::SENT_BYTES)).await?);

        let country = parse_counts(self.store.hash_get_all(&key(field::COUNTRY)).await?);
        let ip = parse_counts(self.store.hash_get_all(&key(field::IP)).await?);
        let resource = parse_counts(self.store.hash_get_all(&key(field::RESOURCE)).await?);
        let response_code = parse_counts(
            self.store
                .hash_get_all(&key(field::RESPONSE_CODE))
                .await?,
        );

        Ok(Some(AnalyticsBucket {
            quantity,
            received_bytes,
            sent_bytes,
            country,
            ip,
            resource,
            response_code,
        }))
    }

    /// Delete the offset-0 bucket of every scale. Older buckets expire on their own.
    pub async fn purge_current(&self, service_id: &str) -> StoreResult<()> {
        self.purge_current_at(service_id, Utc::now()).await
    }

    pub async fn purge_current_at(&self, service_id: &str, now: DateTime<Utc>) -> StoreResult<()> {
        let keys: Vec<String> = TimeScale::ALL
            .iter()
            .flat_map(|scale| {
                let bucket = canonical_timestamp(scale.bucket_start(now, 0));
                field::ALL
                    .iter()
                    .map(move |f| analytics_key(service_id, *scale, &bucket, f))
            })
            .collect();
        self.store.delete(&keys).await
    }
}

// Hash entries whose key or count does not parse are dropped individually.
fn parse_counts<K: Ord + std::str::FromStr>(raw: HashMap<String, String>) -> BTreeMap<K, u64> {
    raw.into_iter()
        .filter_map(|(k, v)| Some((k.parse::<K>().ok()?, v.parse::<u64>().ok()?)))
        .collect()
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
