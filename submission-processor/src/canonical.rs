//! The canonical application format read by the case handling systems.
use chrono::{DateTime, NaiveDate, Utc};
use serde_derive::{Deserialize, Serialize};

use crate::submission::{Applicant, Child};

pub const CANONICAL_VERSION: &str = "1.0.0";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BenefitType {
    /// Extended care days for a chronically ill or disabled child.
    ChronicIllnessExtension,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalApplicant {
    pub national_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalChild {
    pub national_id: Option<String>,
    pub birth_date: Option<NaiveDate>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Benefit {
    #[serde(rename = "type")]
    pub benefit_type: BenefitType,
    pub child: CanonicalChild,
    pub chronic_illness: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalApplication {
    pub application_id: String,
    pub version: String,
    pub received: DateTime<Utc>,
    pub language: String,
    pub applicant: CanonicalApplicant,
    pub benefit: Benefit,
}

/// Fields of a submission the canonical form is built from.
pub struct CanonicalInput<'a> {
    pub application_id: &'a str,
    pub received: DateTime<Utc>,
    pub language: Option<&'a str>,
    pub applicant: &'a Applicant,
    pub child: &'a Child,
    pub chronic_illness: bool,
}

pub fn build(input: CanonicalInput<'_>) -> CanonicalApplication {
    CanonicalApplication {
        application_id: input.application_id.to_owned(),
        version: CANONICAL_VERSION.to_owned(),
        received: input.received,
        language: input.language.unwrap_or("nb").to_owned(),
        applicant: CanonicalApplicant {
            national_id: input.applicant.national_id.clone(),
        },
        benefit: Benefit {
            benefit_type: BenefitType::ChronicIllnessExtension,
            child: CanonicalChild {
                national_id: input.child.national_id.clone(),
                birth_date: input.child.birth_date,
            },
            chronic_illness: input.chronic_illness,
        },
    }
}

#[cfg(test)]
mod tests {
    use assert_json_diff::assert_json_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn builds_canonical_form() {
        let applicant = Applicant {
            national_id: "02119970078".to_owned(),
            first_name: "Ola".to_owned(),
            middle_name: None,
            last_name: "Nordmann".to_owned(),
            birth_date: None,
        };
        let child = Child {
            name: Some("Kari".to_owned()),
            national_id: None,
            birth_date: NaiveDate::from_ymd_opt(2019, 3, 1),
        };
        let received = "2020-06-01T12:00:00Z".parse().unwrap();

        let canonical = build(CanonicalInput {
            application_id: "app-1",
            received,
            language: None,
            applicant: &applicant,
            child: &child,
            chronic_illness: true,
        });

        assert_json_eq!(
            serde_json::to_value(&canonical).unwrap(),
            json!({
                "applicationId": "app-1",
                "version": "1.0.0",
                "received": "2020-06-01T12:00:00Z",
                "language": "nb",
                "applicant": {"nationalId": "02119970078"},
                "benefit": {
                    "type": "CHRONIC_ILLNESS_EXTENSION",
                    "child": {"nationalId": null, "birthDate": "2019-03-01"},
                    "chronicIllness": true
                }
            })
        );
    }
}
