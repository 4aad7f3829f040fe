use std::future::Future;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use aws_sdk_s3::config::Region;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::{IsisConfig, IsisSourceKind};

/// Raw dump fetched from a source.
#[derive(Debug, Clone)]
pub struct Dump {
    pub fetched_at: DateTime<Utc>,
    pub raw_json: Vec<u8>,
    pub file_name: String,
}

/// Provides the most recent control-plane dump.
pub trait Source: Send + Sync + 'static {
    fn fetch_latest(&self) -> impl Future<Output = Result<Dump>> + Send;
}

/// Reads dumps from an S3 bucket with anonymous access.
pub struct S3Source {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Source {
    pub async fn new(bucket: &str, region: &str, endpoint_url: &str) -> Result<Self> {
        if bucket.is_empty() {
            bail!("S3 bucket is required");
        }

        let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .no_credentials()
            .load()
            .await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if !endpoint_url.is_empty() {
            builder = builder.endpoint_url(endpoint_url).force_path_style(true);
        }

        Ok(Self {
            client: aws_sdk_s3::Client::from_conf(builder.build()),
            bucket: bucket.to_string(),
        })
    }

    async fn latest_key(&self) -> Result<String> {
        let mut latest: Option<String> = None;
        let mut token: Option<String> = None;

        loop {
            let resp = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .set_continuation_token(token.take())
                .send()
                .await
                .with_context(|| format!("listing objects in bucket {}", self.bucket))?;

            for key in resp.contents().iter().filter_map(|o| o.key()) {
                if latest.as_deref().map_or(true, |l| key > l) {
                    latest = Some(key.to_string());
                }
            }

            match resp.next_continuation_token() {
                Some(next) if resp.is_truncated() == Some(true) => token = Some(next.to_string()),
                _ => break,
            }
        }

        latest.ok_or_else(|| anyhow!("no objects found in bucket {}", self.bucket))
    }
}

impl Source for S3Source {
    async fn fetch_latest(&self) -> Result<Dump> {
        let key = self.latest_key().await?;
        debug!(bucket = %self.bucket, key = %key, "fetching isis dump");

        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .with_context(|| format!("getting object {key}"))?;

        let body = resp
            .body
            .collect()
            .await
            .with_context(|| format!("reading object {key}"))?;

        Ok(Dump {
            fetched_at: Utc::now(),
            raw_json: body.into_bytes().to_vec(),
            file_name: key,
        })
    }
}

/// Reads the lexicographically last `*.json` file of a directory.
pub struct DirSource {
    dir: PathBuf,
}

impl DirSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl Source for DirSource {
    async fn fetch_latest(&self) -> Result<Dump> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("reading directory {}", self.dir.display()))?;

        let mut latest: Option<String> = None;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(".json") || !entry.file_type().await?.is_file() {
                continue;
            }
            if latest.as_deref().map_or(true, |l| name.as_str() > l) {
                latest = Some(name);
            }
        }

        let file_name =
            latest.ok_or_else(|| anyhow!("no dump files found in {}", self.dir.display()))?;
        let path = self.dir.join(&file_name);
        let raw_json = tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;

        Ok(Dump {
            fetched_at: Utc::now(),
            raw_json,
            file_name,
        })
    }
}

/// The configured dump source.
pub enum DumpSource {
    S3(S3Source),
    Dir(DirSource),
}

impl DumpSource {
    pub async fn from_config(cfg: &IsisConfig) -> Result<Self> {
        Ok(match cfg.source {
            IsisSourceKind::S3 => {
                Self::S3(S3Source::new(&cfg.bucket, &cfg.region, &cfg.endpoint_url).await?)
            }
            IsisSourceKind::Dir => Self::Dir(DirSource::new(cfg.dir.clone())),
        })
    }
}

impl Source for DumpSource {
    async fn fetch_latest(&self) -> Result<Dump> {
        match self {
            Self::S3(s) => s.fetch_latest().await,
            Self::Dir(d) => d.fetch_latest().await,
        }
    }
}
