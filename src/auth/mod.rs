//! Azure AD sign-in and credential management.

pub mod broker;
pub mod callback_server;
pub mod oauth;
pub mod provider;
pub mod token;

pub use broker::{
    AuthStatus, BrokerConfig, CredentialBroker, FlowHandle, FlowKind, PendingFlow,
    SessionSnapshot, UserPrompt,
};
pub use oauth::AzureAdProvider;
pub use provider::{DeviceCodeGrant, DevicePoll, IdentityProvider, TokenResponse};
pub use token::{AccessToken, CredentialRecord};
