// src/storage/s3.rs
//
// SPDX-License-Identifier: MIT OR Apache-2.0

use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Credentials, Region},
    primitives::ByteStream,
    types::{Delete, ObjectIdentifier},
    Client,
};
use bytes::Bytes;
use tracing::{debug, info, instrument};

use super::{object_key, ObjectStore};
use crate::config::StagingArea;
use crate::error::{PushError, Result};

/// Staging area backed by one S3 bucket
#[derive(Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    pub async fn connect(staging: &StagingArea) -> Result<Self> {
        let credentials = Credentials::new(
            &staging.access_key_id,
            &staging.secret_access_key,
            Some(staging.session_token.clone()),
            None,
            "megapush",
        );

        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(staging.region.clone()))
            .credentials_provider(credentials)
            .load()
            .await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &staging.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        let client = Client::from_conf(builder.build());

        info!(
            "S3 staging client initialized for bucket: {} ({})",
            staging.bucket, staging.region
        );

        Ok(Self {
            client,
            bucket: staging.bucket.clone(),
        })
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn head(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| PushError::storage("head", None, e))?;
        Ok(())
    }

    #[instrument(skip(self, body), fields(bytes = body.len()))]
    async fn put(&self, id: i64, body: Bytes) -> Result<()> {
        let key = object_key(id);
        debug!("Uploading {} bytes to s3://{}/{}", body.len(), self.bucket, key);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| PushError::storage("put", Some(key), e))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: i64) -> Result<()> {
        let key = object_key(id);
        debug!("Deleting s3://{}/{}", self.bucket, key);

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| PushError::storage("delete", Some(key), e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn delete_all(&self) -> Result<()> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .into_paginator()
            .send();

        let mut deleted = 0usize;
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| PushError::storage("list", None, e))?;

            let objects = page
                .contents()
                .iter()
                .filter_map(|obj| obj.key())
                .map(|key| ObjectIdentifier::builder().key(key).build())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| PushError::storage("delete_all", None, e))?;
            if objects.is_empty() {
                continue;
            }

            let count = objects.len();
            let delete = Delete::builder()
                .set_objects(Some(objects))
                .quiet(true)
                .build()
                .map_err(|e| PushError::storage("delete_all", None, e))?;

            self.client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|e| PushError::storage("delete_all", None, e))?;
            deleted += count;
        }

        info!("Emptied s3://{} ({} objects deleted)", self.bucket, deleted);
        Ok(())
    }
}
