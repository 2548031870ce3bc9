//! Caller account handler.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{extract::State, Json};

use crate::engine::Engine;
use crate::http::extract::Caller;
use crate::http::responses::{ApiError, ModelUsage, OrganizationResponse};

/// `GET /v1/organization`: remaining credits and spend per model.
pub async fn organization(
    State(engine): State<Arc<Engine>>,
    Caller(principal): Caller,
) -> Result<Json<OrganizationResponse>, ApiError> {
    let mut per_model = BTreeMap::new();
    for row in engine.usage(&principal.id).await? {
        let (credits, tasks) = per_model.entry(row.model).or_insert((0, 0));
        *credits += row.credits;
        *tasks += 1;
    }

    Ok(Json(OrganizationResponse {
        credit_balance: principal.credit_balance,
        usage: per_model
            .into_iter()
            .map(|(model, (credits, tasks))| ModelUsage {
                model,
                credits,
                tasks,
            })
            .collect(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use mediarun_core::{Endpoint, ModelKind};

    use crate::admission::Submission;
    use crate::http::handlers::testing::engine_with_principal;

    #[tokio::test]
    async fn test_balance_and_usage() {
        let (engine, principal) = engine_with_principal(10).await;
        for _ in 0..2 {
            engine
                .submit(Submission {
                    principal: principal.id.clone(),
                    model: "kokoro".to_string(),
                    endpoint: Endpoint::TextToSpeech,
                    input: json!({}),
                    webhook: None,
                })
                .await
                .unwrap();
        }

        let caller = engine.principal(&principal.id).await.unwrap();
        let Json(org) = organization(State(engine.clone()), Caller(caller))
            .await
            .unwrap();

        assert_eq!(org.credit_balance, 8);
        assert_eq!(
            org.usage,
            vec![ModelUsage {
                model: ModelKind::Kokoro,
                credits: 2,
                tasks: 2,
            }]
        );
        let json = serde_json::to_value(&org).unwrap();
        assert_eq!(json["creditBalance"], 8);
    }
}
