//! # Preprocessing
//!
//! Turns a received record into the enriched record the journaling system
//! reads: identities are resolved, attachments are moved to the document
//! storage, and for applications the canonical form is built.
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use metrics::{counter, histogram};
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use submission_common::envelope::Metadata;

use crate::canonical::{self, CanonicalInput};
use crate::document::{document_id, DocumentStorageGateway, GatewayError};
use crate::identity::IdentityLookup;
use crate::submission::{
    ActorId, DayTransferRequest, Document, DocumentOwner, EnrichedDayTransferRequest,
    EnrichedSubmission, EnrichedSupplementarySubmission, RawSubmission, SupplementarySubmission,
};

const ATTACHMENT_CONTENT_TYPE: &str = "application/pdf";

pub const CHILD_AGE_METRIC: &str = "child_age_years";

/// One bucket per year of age up to 18; older or unknown ages land in +Inf.
pub const CHILD_AGE_BUCKETS: &[f64] = &[
    0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 12.0, 13.0, 14.0, 15.0, 16.0,
    17.0, 18.0,
];

#[derive(Error, Debug)]
pub enum PreprocessingError {
    #[error("failed to store attachments: {0}")]
    GatewayError(#[from] GatewayError),
    #[error("no document id in stored location {0}")]
    InvalidLocation(Url),
}

pub struct PreprocessingService {
    identities: Arc<dyn IdentityLookup>,
    documents: Arc<DocumentStorageGateway>,
}

impl PreprocessingService {
    pub fn new(
        identities: Arc<dyn IdentityLookup>,
        documents: Arc<DocumentStorageGateway>,
    ) -> Self {
        Self {
            identities,
            documents,
        }
    }

    pub async fn preprocess(
        &self,
        submission: RawSubmission,
        metadata: &Metadata,
    ) -> Result<EnrichedSubmission, PreprocessingError> {
        let correlation_id = metadata.correlation_id.as_str();

        let (applicant_actor_id, child_actor_id) = tokio::join!(
            self.resolve(Some(submission.applicant.national_id.as_str()), correlation_id),
            self.resolve(submission.child.national_id.as_deref(), correlation_id),
        );

        let owner = DocumentOwner {
            national_id: submission.applicant.national_id.clone(),
        };
        let document_ids = self
            .store_attachments(&submission.attachments, &owner, &[], correlation_id)
            .await?;

        let canonical = canonical::build(CanonicalInput {
            application_id: &submission.application_id,
            received: submission.received,
            language: submission.language.as_deref(),
            applicant: &submission.applicant,
            child: &submission.child,
            chronic_illness: submission.chronic_illness,
        });

        let enriched = EnrichedSubmission {
            application_id: submission.application_id,
            received: submission.received,
            language: submission.language,
            applicant: submission.applicant,
            applicant_actor_id,
            child: submission.child,
            child_actor_id,
            chronic_illness: submission.chronic_illness,
            relation_to_child: submission.relation_to_child,
            same_address: submission.same_address,
            has_confirmed_information: submission.has_confirmed_information,
            has_understood_rights_and_duties: submission.has_understood_rights_and_duties,
            document_ids,
            canonical,
        };

        report_metrics(&enriched, Utc::now().date_naive());
        counter!("submissions_preprocessed_total", "kind" => "application").increment(1);
        info!(
            correlation_id,
            application_id = %enriched.application_id,
            groups = enriched.document_ids.len(),
            "preprocessed submission"
        );
        Ok(enriched)
    }

    /// Documents sent after an application: the applicant is resolved and
    /// the attachments stored, titled after `titles` where given.
    pub async fn preprocess_supplementary(
        &self,
        submission: SupplementarySubmission,
        metadata: &Metadata,
    ) -> Result<EnrichedSupplementarySubmission, PreprocessingError> {
        let correlation_id = metadata.correlation_id.as_str();

        let applicant_actor_id = self
            .resolve(Some(submission.applicant.national_id.as_str()), correlation_id)
            .await;
        let owner = DocumentOwner {
            national_id: submission.applicant.national_id.clone(),
        };
        let document_ids = self
            .store_attachments(
                &submission.attachments,
                &owner,
                &submission.titles,
                correlation_id,
            )
            .await?;

        counter!("submissions_preprocessed_total", "kind" => "supplementary").increment(1);
        info!(
            correlation_id,
            application_id = %submission.application_id,
            groups = document_ids.len(),
            "preprocessed supplementary submission"
        );
        Ok(EnrichedSupplementarySubmission {
            application_id: submission.application_id,
            received: submission.received,
            language: submission.language,
            applicant: submission.applicant,
            applicant_actor_id,
            description: submission.description,
            application_type: submission.application_type,
            titles: submission.titles,
            has_confirmed_information: submission.has_confirmed_information,
            has_understood_rights_and_duties: submission.has_understood_rights_and_duties,
            document_ids,
        })
    }

    /// A request to transfer days carries no attachments: only the applicant
    /// is resolved.
    pub async fn preprocess_day_transfer(
        &self,
        request: DayTransferRequest,
        metadata: &Metadata,
    ) -> EnrichedDayTransferRequest {
        let correlation_id = metadata.correlation_id.as_str();
        let applicant_actor_id = self
            .resolve(Some(request.applicant.national_id.as_str()), correlation_id)
            .await;

        counter!("submissions_preprocessed_total", "kind" => "day_transfer").increment(1);
        info!(
            correlation_id,
            application_id = %request.application_id,
            days = request.days,
            "preprocessed day transfer request"
        );
        EnrichedDayTransferRequest {
            application_id: request.application_id,
            received: request.received,
            language: request.language,
            applicant: request.applicant,
            applicant_actor_id,
            days: request.days,
            recipient_national_id: request.recipient_national_id,
            has_confirmed_information: request.has_confirmed_information,
            has_understood_rights_and_duties: request.has_understood_rights_and_duties,
        }
    }

    /// Store every attachment group in order, one `store_all` per group.
    /// The returned ids are grouped and ordered like `attachments`.
    async fn store_attachments(
        &self,
        attachments: &[Vec<Url>],
        owner: &DocumentOwner,
        titles: &[String],
        correlation_id: &str,
    ) -> Result<Vec<Vec<String>>, PreprocessingError> {
        let mut document_ids = Vec::with_capacity(attachments.len());
        for (group, pages) in attachments.iter().enumerate() {
            let title = titles
                .get(group)
                .cloned()
                .unwrap_or_else(|| format!("Attachment {}", group + 1));
            let documents = pages
                .iter()
                .map(|page| Document {
                    owner: owner.clone(),
                    title: title.clone(),
                    content_type: ATTACHMENT_CONTENT_TYPE.to_owned(),
                    source: page.clone(),
                })
                .collect();

            let locations = self.documents.store_all(documents, correlation_id).await?;
            let ids = locations
                .into_iter()
                .map(|location| {
                    document_id(&location).ok_or(PreprocessingError::InvalidLocation(location))
                })
                .collect::<Result<Vec<_>, _>>()?;
            document_ids.push(ids);
        }
        Ok(document_ids)
    }

    /// A failed lookup leaves the actor id out rather than failing the record.
    async fn resolve(&self, national_id: Option<&str>, correlation_id: &str) -> Option<ActorId> {
        let national_id = national_id?;
        match self.identities.lookup(national_id, correlation_id).await {
            Ok(actor_id) => actor_id,
            Err(error) => {
                warn!(correlation_id, "identity lookup failed: {}", error);
                None
            }
        }
    }
}

/// The child's birth date, from the submission or else from the first six
/// digits (ddmmyy) of its national id.
pub fn child_birth_date(submission: &EnrichedSubmission) -> Option<NaiveDate> {
    submission.child.birth_date.or_else(|| {
        let national_id = submission.child.national_id.as_deref()?;
        let digits = national_id.get(0..6)?;
        let day = digits.get(0..2)?.parse().ok()?;
        let month = digits.get(2..4)?.parse().ok()?;
        let year: i32 = digits.get(4..6)?.parse().ok()?;
        NaiveDate::from_ymd_opt(2000 + year, month, day)
    })
}

/// Age in whole years. A birth date up to 18 years ahead is reported as 19,
/// past the last age bucket; further ahead, the distance in years is used.
pub fn age_in_years(birth_date: NaiveDate, today: NaiveDate) -> u32 {
    match today.years_since(birth_date) {
        Some(age) => age,
        None => match birth_date.years_since(today) {
            Some(1..=18) => 19,
            Some(ahead) => ahead,
            None => 0,
        },
    }
}

fn yes_no(answer: bool) -> &'static str {
    if answer {
        "yes"
    } else {
        "no"
    }
}

pub fn report_metrics(submission: &EnrichedSubmission, today: NaiveDate) {
    if let Some(birth_date) = child_birth_date(submission) {
        let age = age_in_years(birth_date, today);
        histogram!(CHILD_AGE_METRIC).record(f64::from(age));
        if age == 0 {
            let weeks = (today - birth_date).num_weeks().abs();
            counter!("child_age_weeks_total", "weeks" => weeks.to_string()).increment(1);
        }
    }

    let id_type = match submission.child.national_id {
        Some(_) => "national_id",
        None => "none",
    };
    counter!("child_id_type_total", "id_type" => id_type).increment(1);

    for (question, answer) in [
        ("chronic_illness", submission.chronic_illness),
        ("same_address", submission.same_address),
    ] {
        counter!("yes_no_answers_total", "question" => question, "answer" => yes_no(answer))
            .increment(1);
    }
}

#[cfg(test)]
mod tests {
    use std::time;

    use async_trait::async_trait;
    use httpmock::{Method::POST, MockServer};
    use submission_common::retry::RetryPolicy;
    use submission_common::token::{AccessToken, AccessTokenClient, Scopes, TokenError};

    use submission_common::metrics::recorder_builder;

    use super::*;
    use crate::identity::IdentityError;
    use crate::submission::{Applicant, Child};

    struct StaticToken;

    #[async_trait]
    impl AccessTokenClient for StaticToken {
        async fn get_access_token(&self, _: &Scopes) -> Result<AccessToken, TokenError> {
            Ok(AccessToken::new(
                "token",
                "Bearer",
                time::Duration::from_secs(3600),
            ))
        }
    }

    /// Knows the applicant only, and fails for one given national id.
    struct Registry {
        failing: Option<&'static str>,
    }

    #[async_trait]
    impl IdentityLookup for Registry {
        async fn lookup(
            &self,
            national_id: &str,
            _: &str,
        ) -> Result<Option<ActorId>, IdentityError> {
            if Some(national_id) == self.failing {
                return Err(IdentityError::UnexpectedStatus(
                    reqwest::StatusCode::BAD_GATEWAY,
                ));
            }
            Ok((national_id == "02119970078").then(|| ActorId("actor-1".to_owned())))
        }
    }

    fn service(server: &MockServer, failing: Option<&'static str>) -> PreprocessingService {
        let gateway = DocumentStorageGateway::new(
            reqwest::Client::new(),
            Arc::new(StaticToken),
            &server.base_url().parse().unwrap(),
            Scopes::new(),
            Scopes::new(),
            RetryPolicy::build(2.0, time::Duration::from_millis(10)).provide(),
        )
        .unwrap();
        PreprocessingService::new(
            Arc::new(Registry { failing }),
            Arc::new(gateway),
        )
    }

    fn submission(attachments: Vec<Vec<Url>>) -> RawSubmission {
        RawSubmission {
            application_id: "app-1".to_owned(),
            received: "2020-06-01T12:00:00Z".parse().unwrap(),
            language: Some("nn".to_owned()),
            applicant: Applicant {
                national_id: "02119970078".to_owned(),
                first_name: "Ola".to_owned(),
                middle_name: None,
                last_name: "Nordmann".to_owned(),
                birth_date: None,
            },
            child: Child {
                name: Some("Kari".to_owned()),
                national_id: Some("01011950000".to_owned()),
                birth_date: None,
            },
            chronic_illness: true,
            relation_to_child: None,
            same_address: true,
            has_confirmed_information: true,
            has_understood_rights_and_duties: true,
            attachments,
        }
    }

    fn page(server: &MockServer, group: usize, page: usize) -> Url {
        server
            .url(format!("/uploads/{group}-{page}"))
            .parse()
            .unwrap()
    }

    /// Every page is stored as `doc-{group}-{page}`.
    async fn mock_pages(server: &MockServer, sizes: &[usize]) {
        for (group, size) in sizes.iter().enumerate() {
            for page_number in 0..*size {
                let source = page(server, group, page_number);
                server
                    .mock_async(|when, then| {
                        when.method(POST)
                            .path("/v1/dokument")
                            .json_body_partial(format!(r#"{{"source": "{source}"}}"#));
                        then.status(201).header(
                            "location",
                            format!("/v1/dokument/doc-{group}-{page_number}"),
                        );
                    })
                    .await;
            }
        }
    }

    #[tokio::test]
    async fn document_ids_mirror_attachment_groups() {
        let server = MockServer::start_async().await;
        let sizes = [3, 1, 2];
        mock_pages(&server, &sizes).await;

        let attachments = sizes
            .iter()
            .enumerate()
            .map(|(group, size)| (0..*size).map(|p| page(&server, group, p)).collect())
            .collect();

        let enriched = service(&server, None)
            .preprocess(submission(attachments), &Metadata::new(1))
            .await
            .unwrap();

        assert_eq!(
            enriched.document_ids,
            vec![
                vec!["doc-0-0", "doc-0-1", "doc-0-2"],
                vec!["doc-1-0"],
                vec!["doc-2-0", "doc-2-1"],
            ]
        );
    }

    #[tokio::test]
    async fn identity_misses_and_failures_leave_fields_empty() {
        let server = MockServer::start_async().await;

        let enriched = service(&server, None)
            .preprocess(submission(vec![]), &Metadata::new(1))
            .await
            .unwrap();
        assert_eq!(enriched.applicant_actor_id, Some(ActorId("actor-1".to_owned())));
        assert_eq!(enriched.child_actor_id, None);
        assert!(enriched.document_ids.is_empty());
        assert_eq!(enriched.canonical.language, "nn");

        let enriched = service(&server, Some("02119970078"))
            .preprocess(submission(vec![]), &Metadata::new(1))
            .await
            .unwrap();
        assert_eq!(enriched.applicant_actor_id, None);
    }

    #[tokio::test]
    async fn storage_failure_is_fatal() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/dokument");
                then.status(500);
            })
            .await;

        let result = service(&server, None)
            .preprocess(
                submission(vec![vec![page(&server, 0, 0)]]),
                &Metadata::new(1),
            )
            .await;

        assert!(matches!(result, Err(PreprocessingError::GatewayError(_))));
    }

    #[test]
    fn child_age() {
        let today = NaiveDate::from_ymd_opt(2020, 6, 1).unwrap();

        let born = NaiveDate::from_ymd_opt(2015, 6, 2).unwrap();
        assert_eq!(age_in_years(born, today), 4);
        assert_eq!(age_in_years(today, today), 0);

        // 2010 read as 2030: past the last bucket
        let born = NaiveDate::from_ymd_opt(2030, 1, 1).unwrap();
        assert_eq!(age_in_years(born, today), 19);

        // Later this year counts as no whole year ahead
        let born = NaiveDate::from_ymd_opt(2020, 9, 1).unwrap();
        assert_eq!(age_in_years(born, today), 0);

        // 1995 read as 2095: the distance in years
        let born = NaiveDate::from_ymd_opt(2095, 1, 1).unwrap();
        assert_eq!(age_in_years(born, today), 74);
    }

    #[tokio::test]
    async fn child_age_is_bucketed_by_year() {
        let server = MockServer::start_async().await;
        let mut enriched = service(&server, None)
            .preprocess(submission(vec![]), &Metadata::new(1))
            .await
            .unwrap();
        let today = NaiveDate::from_ymd_opt(2020, 6, 1).unwrap();

        let recorder = recorder_builder(&[(CHILD_AGE_METRIC, CHILD_AGE_BUCKETS)])
            .unwrap()
            .build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            for year in [2008, 2005, 2003] {
                enriched.child.birth_date = NaiveDate::from_ymd_opt(year, 1, 1);
                report_metrics(&enriched, today);
            }
        });

        let rendered = handle.render();
        for (bucket, count) in [("11", 0), ("12", 1), ("15", 2), ("17", 3), ("+Inf", 3)] {
            let line = format!(r#"child_age_years_bucket{{le="{bucket}"}} {count}"#);
            assert!(rendered.contains(&line), "missing {line} in {rendered}");
        }
    }

    fn supplementary(attachments: Vec<Vec<Url>>, titles: &[&str]) -> SupplementarySubmission {
        let application = submission(vec![]);
        SupplementarySubmission {
            application_id: "app-2".to_owned(),
            received: application.received,
            language: None,
            applicant: application.applicant,
            description: "Updated medical certificate".to_owned(),
            application_type: "chronic-illness-extension".to_owned(),
            titles: titles.iter().map(|title| (*title).to_owned()).collect(),
            has_confirmed_information: true,
            has_understood_rights_and_duties: true,
            attachments,
        }
    }

    #[tokio::test]
    async fn supplementary_documents_are_stored_with_titles() {
        let server = MockServer::start_async().await;
        let certificate = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/dokument")
                    .json_body_partial(r#"{"title": "Medical certificate"}"#);
                then.status(201).header("location", "/v1/dokument/certificate");
            })
            .await;
        let untitled = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/dokument")
                    .json_body_partial(r#"{"title": "Attachment 2"}"#);
                then.status(201).header("location", "/v1/dokument/untitled");
            })
            .await;

        let attachments = vec![
            vec![page(&server, 0, 0), page(&server, 0, 1)],
            vec![page(&server, 1, 0)],
        ];
        let enriched = service(&server, None)
            .preprocess_supplementary(
                supplementary(attachments, &["Medical certificate"]),
                &Metadata::new(1),
            )
            .await
            .unwrap();

        assert_eq!(enriched.applicant_actor_id, Some(ActorId("actor-1".to_owned())));
        assert_eq!(enriched.description, "Updated medical certificate");
        assert_eq!(
            enriched.document_ids,
            vec![vec!["certificate", "certificate"], vec!["untitled"]]
        );
        certificate.assert_hits_async(2).await;
        untitled.assert_hits_async(1).await;
    }

    fn day_transfer() -> DayTransferRequest {
        let application = submission(vec![]);
        DayTransferRequest {
            application_id: "app-3".to_owned(),
            received: application.received,
            language: Some("nb".to_owned()),
            applicant: application.applicant,
            days: 5,
            recipient_national_id: "01017012345".to_owned(),
            has_confirmed_information: true,
            has_understood_rights_and_duties: true,
        }
    }

    #[tokio::test]
    async fn day_transfer_resolves_applicant() {
        let server = MockServer::start_async().await;

        let enriched = service(&server, None)
            .preprocess_day_transfer(day_transfer(), &Metadata::new(1))
            .await;
        assert_eq!(enriched.applicant_actor_id, Some(ActorId("actor-1".to_owned())));
        assert_eq!(enriched.days, 5);
        assert_eq!(enriched.recipient_national_id, "01017012345");

        let enriched = service(&server, Some("02119970078"))
            .preprocess_day_transfer(day_transfer(), &Metadata::new(1))
            .await;
        assert_eq!(enriched.applicant_actor_id, None);
    }

    #[tokio::test]
    async fn birth_date_from_national_id() {
        let server = MockServer::start_async().await;
        let mut enriched = service(&server, None)
            .preprocess(submission(vec![]), &Metadata::new(1))
            .await
            .unwrap();

        assert_eq!(
            child_birth_date(&enriched),
            NaiveDate::from_ymd_opt(2019, 1, 1)
        );

        enriched.child.birth_date = NaiveDate::from_ymd_opt(2018, 5, 17);
        assert_eq!(
            child_birth_date(&enriched),
            NaiveDate::from_ymd_opt(2018, 5, 17)
        );

        enriched.child.birth_date = None;
        enriched.child.national_id = Some("99999".to_owned());
        assert_eq!(child_birth_date(&enriched), None);
    }
}
