//! OpenAPI documentation aggregator.
//!
//! Collects all `#[utoipa::path]`-annotated handlers into a single OpenAPI
//! spec, served via Scalar UI at `/docs`.

use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "mailpipe API",
        version = "0.1.0",
        description = "Adaptive three-phase email analysis pipeline: ingest, chain analysis, rule-based triage, and staged LLM enrichment.",
    ),
    tags(
        (name = "Ingest", description = "Batch import and incremental email push"),
        (name = "Emails", description = "Dashboard listing, full records, and reprocessing"),
        (name = "Queue", description = "Stream status, pause/resume, dead-letter requeue"),
        (name = "Health", description = "Compound health, Prometheus metrics, pipeline stats"),
    ),
    paths(
        crate::api::ingest_one,
        crate::api::ingest_batch,
        crate::api::list_emails,
        crate::api::get_email,
        crate::api::reprocess_email,
        crate::api::health,
        crate::api::metrics,
        crate::api::stats,
        crate::api::queue_status,
        crate::api::pause_stream,
        crate::api::resume_stream,
        crate::api::dls_requeue,
    ),
    components(schemas(
        crate::api::IngestResponse,
        crate::api::ReprocessResponse,
    ))
)]
pub struct ApiDoc;
