//! Second-factor gates. Both keep their ceremony state in a [`challenge::ChallengeStore`],
//! and both are entered with a [`ticket::MfaTickets`] ticket from a password login.

pub mod challenge;
pub mod ticket;
pub mod totp;
pub mod webauthn;

pub use challenge::{ChallengeError, ChallengeStore, DEFAULT_CHALLENGE_TTL_SECONDS};
pub use ticket::{Attempt, MAX_FAILED_ATTEMPTS, MfaTickets};
pub use totp::{TotpEnrollment, TotpGate};
pub use webauthn::{StoredCredential, WebauthnGate};
