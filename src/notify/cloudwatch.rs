//! CloudWatch `PutMetricData` over the Query API, signed with AWS
//! Signature Version 4.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client;
use sha2::{Digest, Sha256};
use tracing::info;
use url::Url;

use super::{check_response, MetricDatum, MetricsSink, NotifyError, REQUEST_TIMEOUT};
use crate::config::CloudWatchConfig;

type HmacSha256 = Hmac<Sha256>;

const SERVICE: &str = "monitoring";
const API_VERSION: &str = "2010-08-01";
const CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=utf-8";
const SIGNED_HEADERS: &str = "content-type;host;x-amz-date";

/// Metrics client.  Built once per process and reused for every data point.
pub struct CloudWatchClient {
    client: Client,
    endpoint: Url,
    region: String,
    access_id: String,
    secret_key: String,
}

impl CloudWatchClient {
    pub fn new(config: &CloudWatchConfig) -> Result<Self, NotifyError> {
        let raw = config
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://{SERVICE}.{}.amazonaws.com/", config.region));
        let endpoint = Url::parse(&raw).map_err(|e| NotifyError::Endpoint {
            url: raw.clone(),
            reason: e.to_string(),
        })?;
        if endpoint.host_str().is_none() {
            return Err(NotifyError::Endpoint {
                url: raw,
                reason: "no host".into(),
            });
        }
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(NotifyError::Client)?;
        Ok(Self {
            client,
            endpoint,
            region: config.region.clone(),
            access_id: config.access_id.clone(),
            secret_key: config.secret_key.clone(),
        })
    }

    /// `Host` header value as reqwest will send it.
    fn host(&self) -> String {
        let host = self.endpoint.host_str().unwrap_or_default();
        match self.endpoint.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }

    fn authorization(&self, body: &str, now: DateTime<Utc>) -> SignedHeaders {
        sign(
            &SigningInput {
                access_id: &self.access_id,
                secret_key: &self.secret_key,
                region: &self.region,
                host: &self.host(),
                path: self.endpoint.path(),
                body,
            },
            now,
        )
    }
}

#[async_trait::async_trait]
impl MetricsSink for CloudWatchClient {
    async fn put_metric(&self, datum: &MetricDatum) -> Result<(), NotifyError> {
        println!(
            "Posting to EC2 CloudWatch: namespace: {}, metric: {}, instance: {}, value: {}",
            datum.namespace, datum.metric_name, datum.host_id, datum.value
        );
        let body = put_metric_body(datum);
        let signed = self.authorization(&body, Utc::now());

        let response = self
            .client
            .post(self.endpoint.clone())
            .header("content-type", CONTENT_TYPE)
            .header("x-amz-date", &signed.amz_date)
            .header("authorization", &signed.authorization)
            .body(body)
            .send()
            .await
            .map_err(|source| NotifyError::Transport {
                target: "cloudwatch",
                source,
            })?;
        check_response("cloudwatch", response).await?;
        info!(namespace = %datum.namespace, metric = %datum.metric_name, value = datum.value, "metric posted");
        Ok(())
    }
}

/// Form-encoded `PutMetricData` request body for a single datum.
pub fn put_metric_body(datum: &MetricDatum) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .append_pair("Action", "PutMetricData")
        .append_pair("Version", API_VERSION)
        .append_pair("Namespace", &datum.namespace)
        .append_pair("MetricData.member.1.MetricName", &datum.metric_name)
        .append_pair("MetricData.member.1.Value", &datum.value.to_string())
        .append_pair("MetricData.member.1.Unit", &datum.unit)
        .append_pair("MetricData.member.1.Dimensions.member.1.Name", "InstanceId")
        .append_pair("MetricData.member.1.Dimensions.member.1.Value", &datum.host_id)
        .finish()
}

// ---------------------------------------------------------------------------
// Signature Version 4
// ---------------------------------------------------------------------------

struct SigningInput<'a> {
    access_id: &'a str,
    secret_key: &'a str,
    region: &'a str,
    host: &'a str,
    path: &'a str,
    body: &'a str,
}

#[derive(Debug)]
struct SignedHeaders {
    amz_date: String,
    authorization: String,
}

fn sign(input: &SigningInput<'_>, now: DateTime<Utc>) -> SignedHeaders {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();
    let scope = format!("{date}/{}/{SERVICE}/aws4_request", input.region);

    let canonical_request = format!(
        "POST\n{path}\n\ncontent-type:{CONTENT_TYPE}\nhost:{host}\nx-amz-date:{amz_date}\n\n{SIGNED_HEADERS}\n{payload}",
        path = input.path,
        host = input.host,
        payload = sha256_hex(input.body.as_bytes()),
    );
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
        sha256_hex(canonical_request.as_bytes())
    );

    let key = signing_key(input.secret_key, &date, input.region, SERVICE);
    let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes()));

    SignedHeaders {
        amz_date,
        authorization: format!(
            "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={SIGNED_HEADERS}, Signature={signature}",
            input.access_id
        ),
    }
}

fn signing_key(secret_key: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(format!("AWS4{secret_key}").as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
