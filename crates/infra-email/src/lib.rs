pub mod channel;
pub mod imap_reader;
pub mod smtp;
pub mod xoauth2;

pub use channel::{EmailChannel, EmailChannelOpts, CHANNEL_EMAIL};
pub use smtp::{SmtpPool, LOOP_PREVENTION_HEADER};
