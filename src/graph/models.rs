//! Typed Graph entities used by the server itself.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GraphError;

/// User profile from Microsoft Graph /me endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: String,
    pub display_name: Option<String>,
    pub mail: Option<String>,
    pub user_principal_name: Option<String>,
    pub job_title: Option<String>,
}

impl UserProfile {
    pub fn from_item(item: Value) -> Result<Self, GraphError> {
        serde_json::from_value(item)
            .map_err(|e| GraphError::InvalidResponse(format!("unexpected /me payload: {}", e)))
    }

    /// Display name, falling back to the UPN.
    pub fn display_name_or_upn(&self) -> String {
        first_present(&[&self.display_name, &self.user_principal_name])
            .unwrap_or("unknown user")
            .to_string()
    }

    /// Mailbox address. Accounts without Exchange only have a UPN.
    pub fn email(&self) -> String {
        first_present(&[&self.mail, &self.user_principal_name])
            .unwrap_or_default()
            .to_string()
    }
}

fn first_present<'a>(candidates: &[&'a Option<String>]) -> Option<&'a str> {
    candidates
        .iter()
        .copied()
        .filter_map(Option::as_deref)
        .find(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_profile_from_me_payload() {
        let profile = UserProfile::from_item(json!({
            "@odata.context": "https://graph.microsoft.com/v1.0/$metadata#users/$entity",
            "id": "87d349ed-44d7-43e1-9a83-5f2406dee5bd",
            "displayName": "Adele Vance",
            "mail": "AdeleV@contoso.com",
            "userPrincipalName": "AdeleV@contoso.onmicrosoft.com",
            "jobTitle": "Retail Manager",
        }))
        .unwrap();

        assert_eq!(profile.display_name_or_upn(), "Adele Vance");
        assert_eq!(profile.email(), "AdeleV@contoso.com");
        assert_eq!(profile.job_title.as_deref(), Some("Retail Manager"));
    }

    #[test]
    fn test_profile_without_mailbox() {
        let profile = UserProfile::from_item(json!({
            "id": "u2",
            "displayName": "",
            "mail": null,
            "userPrincipalName": "guest_fabrikam.com#EXT#@contoso.onmicrosoft.com",
        }))
        .unwrap();

        assert_eq!(
            profile.display_name_or_upn(),
            "guest_fabrikam.com#EXT#@contoso.onmicrosoft.com"
        );
        assert_eq!(profile.email(), profile.display_name_or_upn());
    }

    #[test]
    fn test_user_profile_requires_id() {
        assert!(UserProfile::from_item(json!({"displayName": "x"})).is_err());
    }
}
