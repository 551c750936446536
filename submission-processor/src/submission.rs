//! Records carried on the submission topics.
use chrono::{DateTime, NaiveDate, Utc};
use serde_derive::{Deserialize, Serialize};
use url::Url;

use crate::canonical::CanonicalApplication;

/// Id of a person in the identity registry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Applicant {
    pub national_id: String,
    pub first_name: String,
    pub middle_name: Option<String>,
    pub last_name: String,
    pub birth_date: Option<NaiveDate>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Child {
    pub name: Option<String>,
    pub national_id: Option<String>,
    pub birth_date: Option<NaiveDate>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Relation {
    Mother,
    Father,
    AdoptiveParent,
    FosterParent,
}

fn default_language() -> Option<String> {
    Some("nb".to_owned())
}

/// An application as received from the submission API.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSubmission {
    pub application_id: String,
    pub received: DateTime<Utc>,
    #[serde(default = "default_language")]
    pub language: Option<String>,
    pub applicant: Applicant,
    pub child: Child,
    #[serde(default)]
    pub chronic_illness: bool,
    pub relation_to_child: Option<Relation>,
    #[serde(default)]
    pub same_address: bool,
    pub has_confirmed_information: bool,
    pub has_understood_rights_and_duties: bool,
    /// One group per logical attachment, each holding the URIs of its pages.
    #[serde(default)]
    pub attachments: Vec<Vec<Url>>,
}

/// An application with resolved identities and stored attachments.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedSubmission {
    pub application_id: String,
    pub received: DateTime<Utc>,
    pub language: Option<String>,
    pub applicant: Applicant,
    pub applicant_actor_id: Option<ActorId>,
    pub child: Child,
    pub child_actor_id: Option<ActorId>,
    pub chronic_illness: bool,
    pub relation_to_child: Option<Relation>,
    pub same_address: bool,
    pub has_confirmed_information: bool,
    pub has_understood_rights_and_duties: bool,
    /// Stored document ids, grouped and ordered like `RawSubmission::attachments`.
    pub document_ids: Vec<Vec<String>>,
    pub canonical: CanonicalApplication,
}

/// Documents sent after an application, as received from the submission API.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupplementarySubmission {
    pub application_id: String,
    pub received: DateTime<Utc>,
    #[serde(default = "default_language")]
    pub language: Option<String>,
    pub applicant: Applicant,
    pub description: String,
    /// Kind of application the documents supplement.
    pub application_type: String,
    /// Title of each attachment group, by position.
    #[serde(default)]
    pub titles: Vec<String>,
    pub has_confirmed_information: bool,
    pub has_understood_rights_and_duties: bool,
    #[serde(default)]
    pub attachments: Vec<Vec<Url>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedSupplementarySubmission {
    pub application_id: String,
    pub received: DateTime<Utc>,
    pub language: Option<String>,
    pub applicant: Applicant,
    pub applicant_actor_id: Option<ActorId>,
    pub description: String,
    pub application_type: String,
    pub titles: Vec<String>,
    pub has_confirmed_information: bool,
    pub has_understood_rights_and_duties: bool,
    pub document_ids: Vec<Vec<String>>,
}

/// A request to transfer care days to another caregiver.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DayTransferRequest {
    pub application_id: String,
    pub received: DateTime<Utc>,
    #[serde(default = "default_language")]
    pub language: Option<String>,
    pub applicant: Applicant,
    pub days: u32,
    pub recipient_national_id: String,
    pub has_confirmed_information: bool,
    pub has_understood_rights_and_duties: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedDayTransferRequest {
    pub application_id: String,
    pub received: DateTime<Utc>,
    pub language: Option<String>,
    pub applicant: Applicant,
    pub applicant_actor_id: Option<ActorId>,
    pub days: u32,
    pub recipient_national_id: String,
    pub has_confirmed_information: bool,
    pub has_understood_rights_and_duties: bool,
}

/// A journaled record whose stored documents can be cleaned up.
pub trait StoredDocuments {
    fn application_id(&self) -> &str;

    fn owner(&self) -> DocumentOwner;

    fn document_ids(&self) -> &[Vec<String>];
}

impl StoredDocuments for EnrichedSubmission {
    fn application_id(&self) -> &str {
        &self.application_id
    }

    fn owner(&self) -> DocumentOwner {
        DocumentOwner {
            national_id: self.applicant.national_id.clone(),
        }
    }

    fn document_ids(&self) -> &[Vec<String>] {
        &self.document_ids
    }
}

impl StoredDocuments for EnrichedSupplementarySubmission {
    fn application_id(&self) -> &str {
        &self.application_id
    }

    fn owner(&self) -> DocumentOwner {
        DocumentOwner {
            national_id: self.applicant.national_id.clone(),
        }
    }

    fn document_ids(&self) -> &[Vec<String>] {
        &self.document_ids
    }
}

/// Person allowed to read and delete a stored document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentOwner {
    pub national_id: String,
}

/// Body of a store request: the storage service copies the upload at `source`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    #[serde(rename = "eier")]
    pub owner: DocumentOwner,
    pub title: String,
    pub content_type: String,
    pub source: Url,
}

/// Published by the journaling system once a record is journaled.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalConfirmation<S = EnrichedSubmission> {
    pub journal_post_id: String,
    pub submission: S,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupInstruction {
    pub journal_post_id: String,
    pub document_locations: Vec<Url>,
    pub owner: DocumentOwner,
}
