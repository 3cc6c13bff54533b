//! Provenance orchestration
//!
//! Ties the four collaborators together per operation. Media upload and
//! freshness assessment run concurrently ahead of the ledger write, since the
//! write needs both results. Media failure policy: stages where media is
//! optional proceed without it when the store is down; the final stage
//! requires its proof-of-delivery image and aborts instead.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::content::ContentStore;
use crate::freshness::{FreshnessInference, FreshnessReport};
use crate::journey::{reconcile, JourneyView};
use crate::ledger::{LedgerStage, LifecycleLedger, StageRef};
use crate::record::{NewAnnotation, ProductRecord, RecordStore};
use crate::telemetry::TelemetryFeed;
use crate::types::{Actor, Result, TraceError};

/// Registration request
#[derive(Debug, Clone)]
pub struct RegisterProductInput {
    pub tag: String,
    pub name: String,
    pub product_type: String,
    pub origin: String,
    pub harvest_date: DateTime<Utc>,
    pub location: String,
    pub description: String,
    pub image: Option<Bytes>,
}

/// Intermediate or final stage request
#[derive(Debug, Clone)]
pub struct StageInput {
    pub location: String,
    pub description: String,
    pub image: Option<Bytes>,
}

/// Annotation request
#[derive(Debug, Clone)]
pub struct AnnotationInput {
    pub location: String,
    pub description: String,
    pub image: Option<Bytes>,
}

/// Registration result
#[derive(Debug, Clone)]
pub struct RegisteredProduct {
    pub product_id: String,
    pub stage_ref: StageRef,
    pub freshness: FreshnessReport,
    pub media_locator: Option<String>,
}

/// The orchestration service behind every route
#[derive(Clone)]
pub struct ProvenanceService {
    ledger: LifecycleLedger,
    content: Arc<dyn ContentStore>,
    freshness: Arc<FreshnessInference>,
    records: Arc<dyn RecordStore>,
    telemetry: Arc<TelemetryFeed>,
}

impl ProvenanceService {
    pub fn new(
        ledger: LifecycleLedger,
        content: Arc<dyn ContentStore>,
        freshness: Arc<FreshnessInference>,
        records: Arc<dyn RecordStore>,
        telemetry: Arc<TelemetryFeed>,
    ) -> Self {
        Self {
            ledger,
            content,
            freshness,
            records,
            telemetry,
        }
    }

    /// Register a tag: upload + assess concurrently, write stage 0, create
    /// the product record seeded with its harvest annotation.
    pub async fn register_product(
        &self,
        input: RegisterProductInput,
        actor: &Actor,
    ) -> Result<RegisteredProduct> {
        if input.tag.trim().is_empty() {
            return Err(TraceError::BadRequest("tag must not be empty".into()));
        }

        let (media_hash, freshness) = self.upload_optional(input.image.as_ref()).await?;

        let stage_ref = self
            .ledger
            .register(
                &input.tag,
                media_hash.clone(),
                freshness.score,
                &input.location,
                &actor.id,
                &input.description,
            )
            .await?;

        let product_id = Uuid::new_v4().to_string();
        let harvest = NewAnnotation {
            actor_id: actor.id.clone(),
            actor_kind: actor.role,
            location: input.location.clone(),
            description: input.description.clone(),
            media_hash: media_hash.clone(),
        };
        let record = ProductRecord {
            product_id: product_id.clone(),
            tag: input.tag.clone(),
            name: input.name,
            product_type: input.product_type,
            origin: input.origin,
            harvest_date: input.harvest_date,
            farmer: actor.id.clone(),
            annotations: vec![harvest.into_annotation(0)],
        };
        self.records.create(record).await?;

        info!(tag = %input.tag, product_id = %product_id, "product registered");
        Ok(RegisteredProduct {
            product_id,
            stage_ref,
            media_locator: media_hash.map(|h| self.content.locator_for(&h)),
            freshness,
        })
    }

    /// Append an intermediate handling stage. Media is optional and a
    /// store outage downgrades to a stage without it.
    pub async fn record_intermediate(
        &self,
        tag: &str,
        input: StageInput,
        actor: &Actor,
    ) -> Result<StageRef> {
        let (media_hash, freshness) = self.upload_optional(input.image.as_ref()).await?;
        let freshness_score = input.image.as_ref().map(|_| freshness.score);

        self.ledger
            .record_intermediate(
                tag,
                &input.location,
                &actor.id,
                &input.description,
                media_hash,
                freshness_score,
            )
            .await
    }

    /// Record delivery and close the tag. The proof-of-delivery image is
    /// mandatory, so a store outage aborts the stage.
    pub async fn record_final(
        &self,
        tag: &str,
        input: StageInput,
        actor: &Actor,
    ) -> Result<StageRef> {
        let image = input
            .image
            .ok_or_else(|| TraceError::BadRequest("final stage requires an image".into()))?;

        let (put, freshness) = tokio::join!(
            self.content.put(image.clone()),
            self.freshness.assess(&image)
        );
        let media_hash = put?;

        self.ledger
            .record_final(
                tag,
                media_hash,
                freshness.score,
                &input.location,
                &actor.id,
                &input.description,
            )
            .await
    }

    /// Append an annotation to a product record
    pub async fn annotate(
        &self,
        product_id: &str,
        input: AnnotationInput,
        actor: &Actor,
    ) -> Result<crate::record::Annotation> {
        let media_hash = match input.image {
            Some(image) => Some(self.content.put(image).await?),
            None => None,
        };

        self.records
            .append_annotation(
                product_id,
                NewAnnotation {
                    actor_id: actor.id.clone(),
                    actor_kind: actor.role,
                    location: input.location,
                    description: input.description,
                    media_hash,
                },
            )
            .await
    }

    /// Delist a product. Only the registering farmer may do this; referenced
    /// media is released best-effort afterwards.
    pub async fn delist_product(&self, product_id: &str, actor: &Actor) -> Result<()> {
        let released = self.records.delete(product_id, &actor.id).await?;
        for hash in &released {
            if let Err(e) = self.content.release(hash).await {
                warn!(hash = %hash, "media release failed after delist: {}", e);
            }
        }
        info!(product_id = %product_id, media = released.len(), "product delisted");
        Ok(())
    }

    /// Reconcile the three sources for one tag. Stored hashes become
    /// gateway locators on the way out.
    pub async fn journey(&self, tag: &str) -> Result<JourneyView> {
        let stages = self.ledger.get_stages(tag).await?;
        let record = self.records.find_by_tag(tag).await?;
        let pings = self.telemetry.snapshot(tag);

        let mut view = reconcile(tag, &stages, record.as_ref(), &pings);
        for entry in &mut view.entries {
            if let Some(hash) = entry.media.take() {
                entry.media = Some(self.content.locator_for(&hash));
            }
        }
        Ok(view)
    }

    pub async fn get_record(&self, product_id: &str) -> Result<Option<ProductRecord>> {
        self.records.get(product_id).await
    }

    pub async fn get_stages(&self, tag: &str) -> Result<Vec<LedgerStage>> {
        self.ledger.get_stages(tag).await
    }

    pub async fn list_tags(&self) -> Result<Vec<String>> {
        self.ledger.list_tags().await
    }

    pub async fn media(&self, hash: &str) -> Result<Bytes> {
        self.content.get(hash).await
    }

    pub async fn store_media(&self, bytes: Bytes) -> Result<String> {
        self.content.put(bytes).await
    }

    pub fn media_locator(&self, hash: &str) -> String {
        self.content.locator_for(hash)
    }

    /// Upload + assess concurrently when an image is present. A store outage
    /// on this path degrades to "no media" rather than failing the stage.
    async fn upload_optional(
        &self,
        image: Option<&Bytes>,
    ) -> Result<(Option<String>, FreshnessReport)> {
        let Some(image) = image else {
            return Ok((None, FreshnessReport::default()));
        };

        let (put, freshness) = tokio::join!(
            self.content.put(image.clone()),
            self.freshness.assess(image)
        );

        match put {
            Ok(hash) => Ok((Some(hash), freshness)),
            Err(e) if e.is_transient() => {
                warn!("content store unavailable, recording stage without media: {}", e);
                Ok((None, freshness))
            }
            Err(e) => Err(e),
        }
    }
}
