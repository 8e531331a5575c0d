pub mod accounts;
pub mod dao;
pub mod logger;
pub mod migrations;
pub mod pubkeys;
pub mod settings;
pub mod sources_status;
pub mod state_machine;
pub mod watch_dog_job;

pub use accounts::{resolve_account, Identity};
pub use dao::{
    AccountDao, MemoryAccountDao, MemoryPubkeyDao, MemoryReservationDao, PgAccountDao, PgPubkeyDao,
    PgReservationDao, PubkeyDao, ReservationDao,
};
pub use pubkeys::PubkeyService;
pub use settings::{Settings, WatchdogSettings};
pub use sources_status::sources_status;
pub use state_machine::ReservationService;
