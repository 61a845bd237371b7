//! Contact registrar for the sipflow stack.
//!
//! Binding storage and REGISTER processing, including RFC 5626 outbound
//! registrations: flow-token Path synthesis for direct clients, first-hop
//! `ob` validation for proxied registrations, and instance/reg-id keyed
//! bindings.

pub mod error;
pub mod registrar;
pub mod store;

pub use error::{Error, Result};
pub use registrar::{contact_instance, routes_from_contact, Registrar, SEVERAL_REG_IDS};
pub use store::{
    contact_with_route, uri_escape, uri_unescape, Aor, Binding, BindingKey, RegistrarStore,
};
