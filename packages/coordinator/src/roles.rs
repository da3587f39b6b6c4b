//! Role capabilities checked at the service boundary.

use bloodlink_blood_models::UserRole;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::CoordinatorError;

/// Something a caller may be allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ShareLocation,
    RespondToAlert,
    ViewNearbyRequests,
    CreateRequest,
    /// Cancel or inspect requests the caller created.
    ManageOwnRequest,
    /// Cancel or inspect any request.
    ManageAnyRequest,
    ConfirmFulfillment,
    MaintainOwnHealthProfile,
    /// Edit any donor's profile, including the eligibility override.
    ReviewHealthProfiles,
    ViewRequests,
    /// Report locations or responses on a donor's behalf.
    ActForDonors,
}

impl Capability {
    /// Whether `role` carries this capability.
    #[must_use]
    pub const fn granted_to(self, role: UserRole) -> bool {
        match role {
            UserRole::Admin => true,
            UserRole::Donor => matches!(
                self,
                Self::ShareLocation
                    | Self::RespondToAlert
                    | Self::ViewNearbyRequests
                    | Self::MaintainOwnHealthProfile
                    | Self::ViewRequests
            ),
            UserRole::Recipient => matches!(
                self,
                Self::CreateRequest | Self::ManageOwnRequest | Self::ViewRequests
            ),
            UserRole::Hospital => matches!(
                self,
                Self::CreateRequest
                    | Self::ManageOwnRequest
                    | Self::ManageAnyRequest
                    | Self::ConfirmFulfillment
                    | Self::ReviewHealthProfiles
                    | Self::ViewRequests
            ),
        }
    }
}

/// An authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: Uuid,
    pub role: UserRole,
}

impl Actor {
    #[must_use]
    pub const fn new(user_id: Uuid, role: UserRole) -> Self {
        Self { user_id, role }
    }

    #[must_use]
    pub const fn can(&self, capability: Capability) -> bool {
        capability.granted_to(self.role)
    }

    /// # Errors
    ///
    /// Returns [`CoordinatorError::Forbidden`] if the role lacks `capability`.
    pub fn require(&self, capability: Capability) -> Result<(), CoordinatorError> {
        if self.can(capability) {
            Ok(())
        } else {
            Err(CoordinatorError::Forbidden {
                role: self.role,
                capability,
            })
        }
    }

    /// Like [`Actor::require`] but restricted to the caller's own records
    /// unless they hold `any_capability`.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Forbidden`] if the caller may not act on
    /// `owner`'s records.
    pub fn require_owner_or(
        &self,
        owner: Uuid,
        own_capability: Capability,
        any_capability: Capability,
    ) -> Result<(), CoordinatorError> {
        if self.can(any_capability) {
            return Ok(());
        }
        self.require(own_capability)?;
        if self.user_id == owner {
            Ok(())
        } else {
            Err(CoordinatorError::Forbidden {
                role: self.role,
                capability: any_capability,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn donors_cannot_post_requests() {
        let donor = Actor::new(Uuid::new_v4(), UserRole::Donor);
        assert!(donor.require(Capability::ShareLocation).is_ok());
        assert!(matches!(
            donor.require(Capability::CreateRequest),
            Err(CoordinatorError::Forbidden { .. })
        ));
    }

    #[test]
    fn only_admins_act_for_donors() {
        for role in [UserRole::Donor, UserRole::Recipient, UserRole::Hospital] {
            assert!(!Capability::ActForDonors.granted_to(role));
        }
        assert!(Capability::ActForDonors.granted_to(UserRole::Admin));
        assert!(Capability::ConfirmFulfillment.granted_to(UserRole::Admin));
    }

    #[test]
    fn recipients_cancel_only_their_own() {
        let owner = Uuid::new_v4();
        let recipient = Actor::new(owner, UserRole::Recipient);
        let other = Actor::new(Uuid::new_v4(), UserRole::Recipient);
        let hospital = Actor::new(Uuid::new_v4(), UserRole::Hospital);

        let check = |actor: &Actor| {
            actor.require_owner_or(
                owner,
                Capability::ManageOwnRequest,
                Capability::ManageAnyRequest,
            )
        };
        assert!(check(&recipient).is_ok());
        assert!(check(&other).is_err());
        assert!(check(&hospital).is_ok());
        assert!(check(&Actor::new(owner, UserRole::Donor)).is_err());
    }
}
