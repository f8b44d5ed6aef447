//! Multi-party approver requirements keyed by client label (§4.9
//! "ClientApprovalAuthorization", "CheckApproversForLabel").

use ranger_proto::Approval;

/// One label's approval policy: how many approvers an `Approval` needs, and
/// which of them must come from a specific allowlist or group.
#[derive(Debug, Clone, Default)]
pub struct ClientApprovalAuthorization {
    pub required_approvers: Vec<String>,
    pub required_groups: Vec<String>,
    pub num_approvers_required: usize,
    /// If true, the requester must themselves appear in `required_approvers`
    /// or `required_groups` before the approval counts at all.
    pub requester_must_be_authorized: bool,
}

impl ClientApprovalAuthorization {
    /// §4.9 "verifies that enough of the approval's approvers satisfy the
    /// label's requirement; requester is excluded from the count." Group
    /// membership isn't modeled in this datastore, so `required_groups`
    /// participates the same way `required_approvers` does — by name.
    pub fn is_satisfied_by(&self, approval: &Approval) -> bool {
        let has_allowlist = !self.required_approvers.is_empty() || !self.required_groups.is_empty();
        if self.requester_must_be_authorized && has_allowlist && !self.names().any(|n| n == approval.requester) {
            return false;
        }
        if !has_allowlist {
            return approval.approver_count() >= self.num_approvers_required;
        }
        let qualifying = approval
            .approvers
            .iter()
            .filter(|approver| self.names().any(|n| &n == *approver))
            .count();
        qualifying >= self.num_approvers_required
    }

    fn names(&self) -> impl Iterator<Item = String> + '_ {
        self.required_approvers.iter().cloned().chain(self.required_groups.iter().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn approval_with(approvers: &[&str]) -> Approval {
        let mut a = Approval::new("clients/C.1", "alice", "r", Utc::now() + chrono::Duration::hours(1));
        for approver in approvers {
            a.add_approver(approver);
        }
        a
    }

    #[test]
    fn an_unrestricted_policy_just_counts_approvers() {
        let policy = ClientApprovalAuthorization {
            required_approvers: vec![],
            required_groups: vec![],
            num_approvers_required: 2,
            requester_must_be_authorized: false,
        };
        assert!(!policy.is_satisfied_by(&approval_with(&["bob"])));
        assert!(policy.is_satisfied_by(&approval_with(&["bob", "carol"])));
    }

    #[test]
    fn a_named_allowlist_only_counts_qualifying_approvers() {
        let policy = ClientApprovalAuthorization {
            required_approvers: vec!["bob".to_string()],
            required_groups: vec![],
            num_approvers_required: 1,
            requester_must_be_authorized: false,
        };
        assert!(!policy.is_satisfied_by(&approval_with(&["mallory"])), "an approver outside the allowlist must not count");
        assert!(policy.is_satisfied_by(&approval_with(&["mallory", "bob"])));
    }

    #[test]
    fn requester_must_be_authorized_rejects_an_unlisted_requester() {
        let policy = ClientApprovalAuthorization {
            required_approvers: vec!["bob".to_string()],
            required_groups: vec![],
            num_approvers_required: 1,
            requester_must_be_authorized: true,
        };
        // `alice` (the requester baked into approval_with) is not in the allowlist.
        assert!(!policy.is_satisfied_by(&approval_with(&["bob"])));
    }
}
