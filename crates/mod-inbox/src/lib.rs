pub mod service;

pub use service::InboxRegistry;
