// Object storage for cropped faces and, optionally, the generated images themselves.

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::{config::Region, primitives::ByteStream};
use log::info;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stores a PNG under `key` and returns where it ended up.
    async fn put_png(&self, key: &str, data: Vec<u8>) -> Result<String>;
}

pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Store {
    /// Credentials come from the usual AWS environment chain.
    pub async fn new(bucket: String, region: Option<String>) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(Region::new(region));
        }
        let config = loader.load().await;
        info!("Uploading to S3 bucket {}", bucket);
        Self {
            client: aws_sdk_s3::Client::new(&config),
            bucket,
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put_png(&self, key: &str, data: Vec<u8>) -> Result<String> {
        info!("Uploading {} bytes to s3://{}/{}", data.len(), self.bucket, key);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("image/png")
            .body(ByteStream::from(data))
            .send()
            .await
            .with_context(|| format!("failed to upload {}", key))?;
        Ok(format!("s3://{}/{}", self.bucket, key))
    }
}

#[cfg(test)]
pub mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Keeps uploads in memory.
    #[derive(Default)]
    pub struct MemoryStore {
        pub objects: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl ObjectStore for MemoryStore {
        async fn put_png(&self, key: &str, data: Vec<u8>) -> Result<String> {
            self.objects.lock().unwrap().push((key.to_string(), data));
            Ok(format!("mem://{}", key))
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_memory_store() {
        let store = MemoryStore::default();
        let location = store.put_png("faces/a.png", vec![1, 2, 3]).await.unwrap();
        assert_eq!(location, "mem://faces/a.png");
        assert_eq!(store.objects.lock().unwrap().len(), 1);
    }
}
