#![forbid(unsafe_code)]

//! Static role table and capability checks.
//!
//! Every lookup is a pure function of the compiled-in table. A missing
//! session resolves to the empty set, so every check denies by default.

use std::collections::BTreeSet;

use serde::Serialize;
use squadboard_core::{Access, AuthorizationError, Capability, EntityKind, Role, Session};

const ADMIN_CAPABILITIES: &[Capability] = &Capability::ALL;

const COACH_CAPABILITIES: &[Capability] = &[
    Capability::ViewMembers,
    Capability::ManageMembers,
    Capability::ViewMedical,
    Capability::ViewTraining,
    Capability::ManageTraining,
    Capability::ViewAssessments,
    Capability::ManageAssessments,
    Capability::ViewReports,
];

const MEDICAL_CAPABILITIES: &[Capability] = &[
    Capability::ViewMembers,
    Capability::ViewMedical,
    Capability::ManageMedical,
    Capability::ViewTraining,
    Capability::ViewReports,
];

const PLAYER_CAPABILITIES: &[Capability] = &[
    Capability::ViewMembers,
    Capability::ViewTraining,
    Capability::ViewAssessments,
];

const PARENT_CAPABILITIES: &[Capability] = &[Capability::ViewTraining];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<T: IntoIterator<Item = Capability>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[must_use]
pub fn role_capabilities(role: Role) -> &'static [Capability] {
    match role {
        Role::Admin => ADMIN_CAPABILITIES,
        Role::Coach => COACH_CAPABILITIES,
        Role::Medical => MEDICAL_CAPABILITIES,
        Role::Player => PLAYER_CAPABILITIES,
        Role::Parent => PARENT_CAPABILITIES,
    }
}

#[must_use]
pub fn resolve(role: Role) -> CapabilitySet {
    role_capabilities(role).iter().copied().collect()
}

/// Capabilities of the given session; empty when logged out.
#[must_use]
pub fn resolve_session(session: Option<&Session>) -> CapabilitySet {
    session.map_or_else(CapabilitySet::empty, |session| resolve(session.role))
}

#[must_use]
pub fn has_permission(session: Option<&Session>, capability: Capability) -> bool {
    session.is_some_and(|session| role_capabilities(session.role).contains(&capability))
}

/// Checks a capability and reports why it is denied.
///
/// # Errors
/// Returns [`AuthorizationError::Unauthenticated`] without a session and
/// [`AuthorizationError::Forbidden`] when the role lacks the capability.
pub fn authorize(
    session: Option<&Session>,
    capability: Capability,
) -> Result<(), AuthorizationError> {
    let Some(session) = session else {
        return Err(AuthorizationError::Unauthenticated { capability });
    };

    if role_capabilities(session.role).contains(&capability) {
        Ok(())
    } else {
        Err(AuthorizationError::Forbidden {
            role: session.role,
            capability,
        })
    }
}

/// Capability guarding reads or writes of an entity collection.
#[must_use]
pub fn required_capability(kind: EntityKind, access: Access) -> Capability {
    match (kind, access) {
        (EntityKind::Member, Access::Read) => Capability::ViewMembers,
        (EntityKind::Member, Access::Write) => Capability::ManageMembers,
        (EntityKind::MedicalRecord, Access::Read) => Capability::ViewMedical,
        (EntityKind::MedicalRecord, Access::Write) => Capability::ManageMedical,
        (EntityKind::TrainingSession, Access::Read) => Capability::ViewTraining,
        (EntityKind::TrainingSession, Access::Write) => Capability::ManageTraining,
        (EntityKind::SkillAssessment, Access::Read) => Capability::ViewAssessments,
        (EntityKind::SkillAssessment, Access::Write) => Capability::ManageAssessments,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use ulid::Ulid;

    fn session_for(role: Role) -> Session {
        Session {
            user_id: Ulid::new(),
            display_name: format!("{role} user"),
            email: format!("{role}@example.com"),
            role,
            member_id: None,
            avatar_url: None,
            signed_in_at: time::OffsetDateTime::UNIX_EPOCH,
        }
    }

    fn role_strategy() -> impl Strategy<Value = Role> {
        prop::sample::select(Role::ALL.to_vec())
    }

    fn capability_strategy() -> impl Strategy<Value = Capability> {
        prop::sample::select(Capability::ALL.to_vec())
    }

    #[test]
    fn admin_holds_every_capability() {
        let admin = session_for(Role::Admin);
        for capability in Capability::ALL {
            assert!(has_permission(Some(&admin), capability), "{capability}");
        }
        assert_eq!(resolve(Role::Admin).len(), Capability::ALL.len());
    }

    #[test]
    fn no_session_denies_every_capability() {
        for capability in Capability::ALL {
            assert!(!has_permission(None, capability));
            assert_eq!(
                authorize(None, capability),
                Err(AuthorizationError::Unauthenticated { capability })
            );
        }
        assert!(resolve_session(None).is_empty());
    }

    #[test]
    fn manage_members_is_granted_only_where_declared() {
        let granted: Vec<Role> = Role::ALL
            .into_iter()
            .filter(|role| has_permission(Some(&session_for(*role)), Capability::ManageMembers))
            .collect();

        assert_eq!(granted, vec![Role::Admin, Role::Coach]);
    }

    #[test]
    fn players_and_parents_cannot_write_any_entity() {
        for role in [Role::Player, Role::Parent] {
            let session = session_for(role);
            for kind in EntityKind::ALL {
                let capability = required_capability(kind, Access::Write);
                assert!(!has_permission(Some(&session), capability), "{role} {kind}");
            }
        }
    }

    #[test]
    fn forbidden_reports_role_and_capability() {
        let parent = session_for(Role::Parent);

        let err = authorize(Some(&parent), Capability::ManageMedical);

        assert_eq!(
            err,
            Err(AuthorizationError::Forbidden {
                role: Role::Parent,
                capability: Capability::ManageMedical,
            })
        );
    }

    #[test]
    fn every_role_resolves_to_a_non_empty_set() {
        for role in Role::ALL {
            assert!(!resolve(role).is_empty(), "{role}");
        }
    }

    proptest! {
        #[test]
        fn has_permission_matches_the_role_table(
            role in role_strategy(),
            capability in capability_strategy(),
        ) {
            let session = session_for(role);
            prop_assert_eq!(
                has_permission(Some(&session), capability),
                resolve(role).contains(capability)
            );
            prop_assert_eq!(
                authorize(Some(&session), capability).is_ok(),
                resolve(role).contains(capability)
            );
        }
    }
}
