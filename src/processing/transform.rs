//! Day encoding: log-scale continuous features and substitute categorical keys.
//!
//! Both transforms are pure; [`encode_day`] applies them as two passes over a [`RawDay`].

use crate::types::{DayArrays, NUM_DENSE, NUM_SPARSE, RawDay};

use super::vocabulary::VocabularySet;

/// `ln(max(value, 0) + 1)`.
pub fn log_transform(value: i32) -> f32 {
    (value.max(0) as f32).ln_1p()
}

/// Apply [`log_transform`] to every continuous feature of a row.
pub fn transform_continuous(values: &[i32; NUM_DENSE]) -> [f32; NUM_DENSE] {
    values.map(log_transform)
}

/// Replace raw categorical keys with dense indices (unseen keys map to 0).
pub fn substitute_categorical(keys: &[u32; NUM_SPARSE], vocab: &VocabularySet) -> [u32; NUM_SPARSE] {
    vocab.encode(keys)
}

/// Encode a whole day: continuous pass, then categorical pass.
pub fn encode_day(raw: &RawDay, vocab: &VocabularySet) -> DayArrays {
    let continuous = raw.continuous.iter().map(transform_continuous).collect();
    let categorical = raw
        .categorical
        .iter()
        .map(|keys| substitute_categorical(keys, vocab))
        .collect();
    DayArrays {
        labels: raw.labels.clone(),
        continuous,
        categorical,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::vocabulary::{merge_day_uniques, DayUniques};
    use crate::types::Record;

    #[test]
    fn negatives_clamp_to_zero() {
        assert_eq!(log_transform(-3), 0.0);
        assert_eq!(log_transform(0), 0.0);
    }

    #[test]
    fn seven_maps_to_ln_eight() {
        assert!((log_transform(7) - 8f32.ln()).abs() < 1e-6);
        assert!((log_transform(7) - 2.0794).abs() < 1e-4);
    }

    #[test]
    fn encode_day_keeps_row_alignment() {
        let mut raw = RawDay::with_capacity(2);
        let mut a = [0u32; NUM_SPARSE];
        a[0] = 42;
        let mut b = [0u32; NUM_SPARSE];
        b[0] = 7;
        raw.push(Record {
            label: 1,
            continuous: [7; NUM_DENSE],
            categorical: a,
        });
        raw.push(Record {
            label: 0,
            continuous: [-1; NUM_DENSE],
            categorical: b,
        });

        let mut uniques = DayUniques::new();
        for keys in &raw.categorical {
            uniques.observe(keys);
        }
        let vocab = merge_day_uniques(&[uniques]);

        let out = encode_day(&raw, &vocab);
        assert_eq!(out.labels, vec![1, 0]);
        assert_eq!(out.categorical[0][0], 0);
        assert_eq!(out.categorical[1][0], 1);
        assert_eq!(out.continuous[1], [0.0; NUM_DENSE]);
        assert!((out.continuous[0][12] - 8f32.ln()).abs() < 1e-6);
    }
}
