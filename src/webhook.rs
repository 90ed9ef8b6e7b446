//! Validating admission webhook for SSP.
//!
//! Thin HTTPS surface over [`SspValidator`]: CREATE runs the full create
//! checks, UPDATE re-checks the DataImportCronTemplate rules, everything
//! else is allowed.

use std::sync::Arc;

use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use tracing::{info, warn};
use warp::Filter;

use crate::admission::SspValidator;
use crate::crd::ssp::Ssp;
use crate::error::Error;

pub const VALIDATE_PATH: &str = "validate-ssp-kubevirt-io-v1beta1-ssp";

/// Start the validating webhook server on the given address.
/// Returns a future that runs the HTTPS server forever.
pub async fn run(
    validator: Arc<SspValidator>,
    addr: std::net::SocketAddr,
    tls_cert: &str,
    tls_key: &str,
) {
    info!(%addr, "starting validating webhook server");
    warp::serve(routes(validator))
        .tls()
        .cert_path(tls_cert)
        .key_path(tls_key)
        .run(addr)
        .await;
}

pub fn routes(
    validator: Arc<SspValidator>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    warp::post()
        .and(warp::path(VALIDATE_PATH))
        .and(warp::path::end())
        .and(warp::body::json())
        .and(warp::any().map(move || validator.clone()))
        .then(|review: AdmissionReview<Ssp>, validator: Arc<SspValidator>| async move {
            let req: AdmissionRequest<Ssp> = match review.try_into() {
                Ok(req) => req,
                Err(e) => {
                    warn!(%e, "invalid admission request");
                    let resp = AdmissionResponse::invalid(format!("invalid request: {e}"));
                    return warp::reply::json(&resp.into_review());
                }
            };
            let resp = validate(&validator, &req).await;
            warp::reply::json(&resp.into_review())
        })
}

/// Validate an SSP admission request.
pub async fn validate(validator: &SspValidator, req: &AdmissionRequest<Ssp>) -> AdmissionResponse {
    let result = match (&req.operation, &req.object, &req.old_object) {
        (Operation::Create, Some(candidate), _) => validator.validate_create(candidate).await,
        // Some clients omit oldObject; the candidate checks still apply.
        (Operation::Update, Some(candidate), previous) => {
            let previous = previous.as_ref().unwrap_or(candidate);
            validator.validate_update(candidate, previous).await
        }
        _ => Ok(()),
    };
    match result {
        Ok(()) => AdmissionResponse::from(req),
        Err(Error::Validation(msg)) => {
            info!(name = %req.name, %msg, "rejected SSP");
            AdmissionResponse::from(req).deny(msg)
        }
        Err(e) => {
            warn!(name = %req.name, error = %e, "admission check failed");
            AdmissionResponse::from(req).deny(format!("unable to validate SSP: {e}"))
        }
    }
}
