// src/reconcile.rs

use crate::normalize::normalize;
use serde::{Deserialize, Serialize};

/// One line as the recognizer returned it. Every value arrives as a string;
/// the recognizer is instructed to emit "" for anything illegible, but we
/// do not rely on that contract: missing keys, nulls, and stray numeric
/// types all land here as "missing or some text" rather than failing the
/// whole payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawLineItem {
    #[serde(default, deserialize_with = "lenient_text")]
    pub name: String,
    #[serde(default, rename = "quantity", deserialize_with = "lenient_scalar")]
    pub quantity_raw: Option<String>,
    #[serde(default, rename = "unit_price", deserialize_with = "lenient_scalar")]
    pub unit_price_raw: Option<String>,
    #[serde(default, rename = "line_total", deserialize_with = "lenient_scalar")]
    pub line_total_raw: Option<String>,
    #[serde(default, deserialize_with = "lenient_scalar")]
    pub category: Option<String>,
}

/// Accept whatever scalar the recognizer actually sent. A number becomes
/// its text form and goes through the normalizer like any handwriting.
fn lenient_scalar<'de, D>(de: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(de)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

fn lenient_text<'de, D>(de: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(de)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => String::new(),
        Some(serde_json::Value::String(s)) => s,
        Some(other) => other.to_string(),
    })
}

/// Diagnostic outcome for one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// quantity × unit price agrees with the stated total.
    Consistent,
    /// Agrees only once the computed total is rounded to a whole amount,
    /// the way vendors often zero out fractional totals by hand.
    ConsistentRounded,
    /// Not enough numbers on the line to judge either way.
    Insufficient,
    /// The arithmetic disagrees and a human should look.
    NeedsReview,
    /// Force-correct mode replaced the stated total with the computed one.
    Corrected,
    /// The recognizer failed on the whole sheet; this row is a placeholder.
    RecognitionFailed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Consistent => "consistent",
            Status::ConsistentRounded => "consistent_rounded",
            Status::Insufficient => "insufficient",
            Status::NeedsReview => "needs_review",
            Status::Corrected => "corrected",
            Status::RecognitionFailed => "recognition_failed",
        }
    }
}

/// How close "close enough" is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToleranceMode {
    /// Totals must agree to the cent.
    #[default]
    Strict,
    /// Additionally accept a stated total equal to the computed total
    /// rounded to the nearest whole amount.
    Rounded,
}

/// What to do with a row that fails the cross-check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorrectionMode {
    /// Flag and suggest only. Never touches the data.
    #[default]
    Diagnose,
    /// Overwrite the stated line total with the computed one.
    Force,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcilePolicy {
    pub tolerance: ToleranceMode,
    pub correction: CorrectionMode,
}

/// RawLineItem plus the numbers derived from it. The derived fields are a
/// pure function of the three raw numeric fields; they are never stored and
/// never survive an edit to the raws.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosedLineItem {
    pub raw: RawLineItem,
    pub quantity_num: Option<f64>,
    pub unit_price_num: Option<f64>,
    pub line_total_num: Option<f64>,
    pub computed_total: Option<f64>,
    pub implied_quantity: Option<f64>,
    pub implied_unit_price: Option<f64>,
    pub status: Status,
    pub note: Option<String>,
}

impl DiagnosedLineItem {
    /// Placeholder row for a sheet the recognizer could not read at all.
    /// Keeps the sheet visible in every report instead of dropping it.
    pub fn recognition_failure(filename: &str, error: &str) -> Self {
        DiagnosedLineItem {
            raw: RawLineItem {
                name: filename.to_string(),
                ..RawLineItem::default()
            },
            quantity_num: None,
            unit_price_num: None,
            line_total_num: None,
            computed_total: None,
            implied_quantity: None,
            implied_unit_price: None,
            status: Status::RecognitionFailed,
            note: Some(error.to_string()),
        }
    }
}

/// Equal to the cent: both round to the same value at two decimal places,
/// or differ by less than 0.01.
fn totals_match(computed: f64, stated: f64) -> bool {
    let cents = |v: f64| (v * 100.0).round();
    cents(computed) == cents(stated) || (computed - stated).abs() < 0.01
}

/// Guarded division: missing or zero denominator gives missing, never a
/// panic or an infinity.
fn divide(numerator: Option<f64>, denominator: Option<f64>) -> Option<f64> {
    match (numerator, denominator) {
        (Some(n), Some(d)) if d != 0.0 => Some(n / d),
        _ => None,
    }
}

/// Diagnose a single line. Rows are independent; see [`reconcile`] for the
/// batch entry point.
pub fn diagnose_row(raw: &RawLineItem, policy: ReconcilePolicy) -> DiagnosedLineItem {
    let mut raw = raw.clone();

    let quantity_num = normalize(raw.quantity_raw.as_deref());
    let unit_price_num = normalize(raw.unit_price_raw.as_deref());
    let mut line_total_num = normalize(raw.line_total_raw.as_deref());

    let computed_total = match (quantity_num, unit_price_num) {
        (Some(q), Some(p)) => Some(q * p),
        _ => None,
    };
    let mut implied_quantity = divide(line_total_num, unit_price_num);
    let mut implied_unit_price = divide(line_total_num, quantity_num);

    let mut note = None;
    let status = match (computed_total, line_total_num) {
        (Some(ct), Some(lt)) => {
            if totals_match(ct, lt) {
                Status::Consistent
            } else if policy.tolerance == ToleranceMode::Rounded && ct.round() == lt {
                Status::ConsistentRounded
            } else if policy.correction == CorrectionMode::Force {
                // Overwrite the stated total with the computed one, at two
                // decimals, and re-derive everything from the new raw so no
                // stale number survives.
                note = Some(format!(
                    "line total {lt:.2} replaced with computed {ct:.2}"
                ));
                raw.line_total_raw = Some(format!("{ct:.2}"));
                line_total_num = normalize(raw.line_total_raw.as_deref());
                implied_quantity = divide(line_total_num, unit_price_num);
                implied_unit_price = divide(line_total_num, quantity_num);
                Status::Corrected
            } else {
                note = Some(review_note(ct, lt, implied_quantity, implied_unit_price));
                Status::NeedsReview
            }
        }
        _ => Status::Insufficient,
    };

    DiagnosedLineItem {
        raw,
        quantity_num,
        unit_price_num,
        line_total_num,
        computed_total,
        implied_quantity,
        implied_unit_price,
        status,
        note,
    }
}

fn review_note(
    computed: f64,
    stated: f64,
    implied_quantity: Option<f64>,
    implied_unit_price: Option<f64>,
) -> String {
    let mut parts = vec![format!(
        "computed total {computed:.2} differs from recognized {stated:.2} by {:.2}",
        (computed - stated).abs()
    )];
    if let Some(q) = implied_quantity {
        parts.push(format!("quantity implied by total: {q:.2}"));
    }
    if let Some(p) = implied_unit_price {
        parts.push(format!("unit price implied by total: {p:.2}"));
    }
    parts.join("; ")
}

/// Cross-check every recognized line. Pure: same input, same output, row
/// order preserved, no row ever dropped.
pub fn reconcile(items: &[RawLineItem], policy: ReconcilePolicy) -> Vec<DiagnosedLineItem> {
    items.iter().map(|it| diagnose_row(it, policy)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(name: &str, qty: &str, price: &str, total: &str) -> RawLineItem {
        RawLineItem {
            name: name.to_string(),
            quantity_raw: Some(qty.to_string()),
            unit_price_raw: Some(price.to_string()),
            line_total_raw: Some(total.to_string()),
            category: None,
        }
    }

    #[test]
    fn test_consistent_row() {
        let d = diagnose_row(
            &row("雪花纯生", "5", "85", "425"),
            ReconcilePolicy::default(),
        );
        assert_eq!(d.computed_total, Some(425.0));
        assert_eq!(d.status, Status::Consistent);
        assert!(d.note.is_none());
    }

    #[test]
    fn test_tolerance_boundary_needs_review_in_both_modes() {
        // 23 × 15.9 = 365.7 against a stated 365. Off by 0.70, and 365.7
        // rounds to 366, so even rounding-tolerant mode flags it.
        let raw = row("羊肉", "23", "15.9", "365");

        let strict = diagnose_row(&raw, ReconcilePolicy::default());
        assert_eq!(strict.status, Status::NeedsReview);
        assert!((strict.computed_total.unwrap() - 365.7).abs() < 1e-9);

        let rounded = diagnose_row(
            &raw,
            ReconcilePolicy {
                tolerance: ToleranceMode::Rounded,
                ..ReconcilePolicy::default()
            },
        );
        assert_eq!(rounded.status, Status::NeedsReview);
    }

    #[test]
    fn test_rounded_mode_accepts_zeroed_total() {
        // 3 × 16.6 = 49.8, vendor wrote 50.
        let raw = row("鲈鱼", "3", "16.6", "50");

        let strict = diagnose_row(&raw, ReconcilePolicy::default());
        assert_eq!(strict.status, Status::NeedsReview);

        let rounded = diagnose_row(
            &raw,
            ReconcilePolicy {
                tolerance: ToleranceMode::Rounded,
                ..ReconcilePolicy::default()
            },
        );
        assert_eq!(rounded.status, Status::ConsistentRounded);
    }

    #[test]
    fn test_missing_unit_price_is_insufficient() {
        let d = diagnose_row(&row("青菜", "4", "", "18"), ReconcilePolicy::default());
        assert_eq!(d.status, Status::Insufficient);
        assert_eq!(d.computed_total, None);
        // The other two fields still imply a unit price for the reviewer.
        assert_eq!(d.implied_unit_price, Some(4.5));
        assert_eq!(d.implied_quantity, None);
    }

    #[test]
    fn test_zero_denominator_guard() {
        let d = diagnose_row(&row("赠品", "0", "0", "10"), ReconcilePolicy::default());
        assert_eq!(d.implied_quantity, None);
        assert_eq!(d.implied_unit_price, None);
        assert!(d.implied_unit_price.map_or(true, f64::is_finite));
    }

    #[test]
    fn test_noisy_fields_normalize_before_checking() {
        let d = diagnose_row(
            &row("雪花纯生", "5件", "85元", "425元"),
            ReconcilePolicy::default(),
        );
        assert_eq!(d.status, Status::Consistent);
    }

    #[test]
    fn test_force_correct_overwrites_total() {
        let d = diagnose_row(
            &row("羊肉", "23", "15.9", "365"),
            ReconcilePolicy {
                tolerance: ToleranceMode::Strict,
                correction: CorrectionMode::Force,
            },
        );
        assert_eq!(d.status, Status::Corrected);
        assert_eq!(d.raw.line_total_raw.as_deref(), Some("365.70"));
        assert_eq!(d.line_total_num, Some(365.7));
        assert!(d.note.as_deref().unwrap().contains("365.00"));
    }

    #[test]
    fn test_force_correct_leaves_consistent_rows_alone() {
        let d = diagnose_row(
            &row("雪花纯生", "5", "85", "425"),
            ReconcilePolicy {
                tolerance: ToleranceMode::Strict,
                correction: CorrectionMode::Force,
            },
        );
        assert_eq!(d.status, Status::Consistent);
        assert_eq!(d.raw.line_total_raw.as_deref(), Some("425"));
    }

    #[test]
    fn test_reconcile_preserves_order_and_count() {
        let items = vec![
            row("a", "1", "2", "2"),
            row("b", "", "", ""),
            row("c", "2", "3", "7"),
        ];
        let out = reconcile(&items, ReconcilePolicy::default());
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].raw.name, "a");
        assert_eq!(out[0].status, Status::Consistent);
        assert_eq!(out[1].status, Status::Insufficient);
        assert_eq!(out[2].status, Status::NeedsReview);
    }

    #[test]
    fn test_idempotent_over_unchanged_raws() {
        let items = vec![row("羊肉", "23", "15.9", "365"), row("青菜", "4", "", "18")];
        let once = reconcile(&items, ReconcilePolicy::default());
        let raws: Vec<RawLineItem> = once.iter().map(|d| d.raw.clone()).collect();
        let twice = reconcile(&raws, ReconcilePolicy::default());
        for (a, b) in once.iter().zip(&twice) {
            assert_eq!(a.status, b.status);
            assert_eq!(a.computed_total, b.computed_total);
            assert_eq!(a.implied_quantity, b.implied_quantity);
            assert_eq!(a.implied_unit_price, b.implied_unit_price);
        }
    }

    #[test]
    fn test_missing_keys_deserialize_as_missing() {
        let items: Vec<RawLineItem> =
            serde_json::from_str(r#"[{"name": "鸡蛋", "quantity": "2"}]"#).unwrap();
        let d = diagnose_row(&items[0], ReconcilePolicy::default());
        assert_eq!(d.quantity_num, Some(2.0));
        assert_eq!(d.status, Status::Insufficient);
    }

    #[test]
    fn test_contract_violations_degrade_not_fail() {
        // Recognizer disobeys the all-strings contract: numeric quantity,
        // null price. The payload still parses and the row still gets a
        // status.
        let items: Vec<RawLineItem> = serde_json::from_str(
            r#"[{"name": "鸭腿", "quantity": 5, "unit_price": null, "line_total": "42.5"}]"#,
        )
        .unwrap();
        let d = diagnose_row(&items[0], ReconcilePolicy::default());
        assert_eq!(d.quantity_num, Some(5.0));
        assert_eq!(d.unit_price_num, None);
        assert_eq!(d.status, Status::Insufficient);
        assert_eq!(d.implied_unit_price, Some(8.5));
    }

    #[test]
    fn test_failure_placeholder_row() {
        let d = DiagnosedLineItem::recognition_failure("sheet_03.jpg", "API error 500");
        assert_eq!(d.status, Status::RecognitionFailed);
        assert_eq!(d.note.as_deref(), Some("API error 500"));
        assert_eq!(d.raw.name, "sheet_03.jpg");
    }
}
