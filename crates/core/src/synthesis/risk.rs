use crate::domain::model::{ModelBundle, PayoutGrade};

pub const NO_MATERIAL_RISK: &str = "未發現重大風險提示";

/// Human-readable caveats derived from DCF and dividend diagnostics.
pub fn annotate(bundle: &ModelBundle) -> Vec<String> {
    let mut risks = Vec::new();

    if let Some(dcf) = bundle.dcf() {
        if dcf.terminal_ratio_pct > 85.0 {
            risks.push("終端價值佔比偏高，估值對長期假設敏感".to_string());
        } else if dcf.terminal_ratio_pct < 40.0 {
            risks.push("終端價值佔比偏低，短期現金流主導".to_string());
        }
        if dcf.shares_estimated {
            risks.push("流通股數使用預設值，公允價值可能有偏差".to_string());
        }
        if dcf.fcf_base < 0.0 {
            risks.push("自由現金流為負值，DCF 估值可靠性降低".to_string());
        }
    }

    if let Some(div) = bundle.dividend() {
        if div.payout_grade == PayoutGrade::Warning {
            let ratio = div
                .payout_ratio_pct
                .map(|r| format!("{r}%"))
                .unwrap_or_else(|| "N/A".to_string());
            risks.push(format!("配息率過高（{ratio}），配息可能不可持續"));
        }
        if div.consecutive_years < 3 {
            risks.push("連續配息年數不足 3 年，配息穩定性存疑".to_string());
        }
    }

    if risks.is_empty() {
        risks.push(NO_MATERIAL_RISK.to_string());
    }
    risks
}
