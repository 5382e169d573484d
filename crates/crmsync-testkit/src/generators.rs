//! Proptest generators for property-based testing.

use proptest::prelude::*;

use crmsync_core::Timestamp;
use crmsync_sync::Fields;

use crate::fixtures::remote_company;

const INN10_WEIGHTS: [u32; 9] = [2, 4, 10, 3, 5, 9, 4, 6, 8];
const INN12_WEIGHTS_11: [u32; 10] = [7, 2, 4, 10, 3, 5, 9, 4, 6, 8];
const INN12_WEIGHTS_12: [u32; 11] = [3, 7, 2, 4, 10, 3, 5, 9, 4, 6, 8];

fn control_digit(digits: &[u32], weights: &[u32]) -> u32 {
    let sum: u32 = digits.iter().zip(weights).map(|(d, w)| d * w).sum();
    (sum % 11) % 10
}

fn render(digits: &[u32]) -> String {
    digits.iter().map(|d| char::from(b'0' + *d as u8)).collect()
}

/// Generate a well-formed 10 digit INN.
pub fn legal_inn() -> impl Strategy<Value = String> {
    prop::collection::vec(0u32..10, 9).prop_map(|mut digits| {
        let check = control_digit(&digits, &INN10_WEIGHTS);
        digits.push(check);
        render(&digits)
    })
}

/// Generate a well-formed 12 digit INN.
pub fn person_inn() -> impl Strategy<Value = String> {
    prop::collection::vec(0u32..10, 10).prop_map(|mut digits| {
        let first = control_digit(&digits, &INN12_WEIGHTS_11);
        digits.push(first);
        let second = control_digit(&digits, &INN12_WEIGHTS_12);
        digits.push(second);
        render(&digits)
    })
}

/// Generate a reasonable timestamp.
pub fn timestamp() -> impl Strategy<Value = Timestamp> {
    1i64..=1_700_000_000_000i64
}

/// Generate a company name.
pub fn company_name() -> impl Strategy<Value = String> {
    ("[A-Z][a-z]{2,12}", prop_oneof![Just("Ltd"), Just("LLC"), Just("Group")])
        .prop_map(|(stem, suffix)| format!("{stem} {suffix}"))
}

/// Parameters for a remote company record.
#[derive(Debug, Clone)]
pub struct RemoteCompanyParams {
    pub name: String,
    pub inn: String,
    pub phone: Option<String>,
}

impl RemoteCompanyParams {
    pub fn fields(&self) -> Fields {
        let mut f = remote_company(&self.name, &self.inn);
        if let Some(phone) = &self.phone {
            f.insert("PHONE".into(), serde_json::json!(phone));
        }
        f
    }
}

impl Arbitrary for RemoteCompanyParams {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        (
            company_name(),
            legal_inn(),
            prop::option::of("\\+7[0-9]{10}"),
        )
            .prop_map(|(name, inn, phone)| RemoteCompanyParams { name, inn, phone })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crmsync_core::validate_tax_id;

    proptest! {
        #[test]
        fn test_generated_inns_are_valid(legal in legal_inn(), person in person_inn()) {
            prop_assert!(validate_tax_id(&legal).is_ok());
            prop_assert!(validate_tax_id(&person).is_ok());
        }

        #[test]
        fn test_corrupted_check_digit_is_rejected(inn in legal_inn()) {
            let mut digits: Vec<u32> = inn.chars().filter_map(|c| c.to_digit(10)).collect();
            digits[9] = (digits[9] + 1) % 10;
            prop_assert!(validate_tax_id(&render(&digits)).is_err());
        }
    }
}
