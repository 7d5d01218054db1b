//! Decision encoding.
//!
//! Current revision (`item/*/requestApproval`):
//!
//! ```json
//! { "decision": "accept" | "acceptForSession" | "decline" | "cancel" }
//! { "decision": { "acceptWithExecpolicyAmendment": { "execpolicy_amendment": … } } }
//! ```
//!
//! Legacy revision (`execCommandApproval`, `applyPatchApproval`):
//!
//! ```json
//! { "decision": "approved" | "approved_for_session" | "denied" | "abort" }
//! ```

use serde_json::{json, Value};

use super::Decision;
use crate::rpc::methods;

fn is_legacy(method: &str) -> bool {
    method == methods::LEGACY_EXEC_APPROVAL || method == methods::LEGACY_PATCH_APPROVAL
}

/// Reply body for `decision` on a request that arrived on `method`.
#[must_use]
pub fn decision_result(method: &str, decision: &Decision) -> Value {
    if is_legacy(method) {
        let name = match decision {
            // No amendment channel in the legacy revision.
            Decision::AcceptOnce | Decision::AcceptWithAmendment { .. } => "approved",
            Decision::AcceptForSession => "approved_for_session",
            Decision::Decline { .. } => "denied",
            Decision::Abort => "abort",
        };
        return json!({ "decision": name });
    }

    let value = match decision {
        Decision::AcceptOnce => json!("accept"),
        Decision::AcceptForSession => json!("acceptForSession"),
        Decision::Decline { .. } => json!("decline"),
        Decision::Abort => json!("cancel"),
        Decision::AcceptWithAmendment { amendment } => json!({
            "acceptWithExecpolicyAmendment": { "execpolicy_amendment": amendment }
        }),
    };
    json!({ "decision": value })
}

/// Reply written when nobody answered an approval in time.
#[must_use]
pub fn unanswered_approval_result(method: &str) -> Value {
    decision_result(method, &Decision::Decline { reason: None })
}
