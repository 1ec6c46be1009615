//! Embedded SQL store with forward migrations, backing every
//! other CM component. Plain `sqlx` sqlite, no ORM — the same style as
//! `mvirt-vmm::store` and `mvirt-net::store`.

mod migrations;
mod store;

pub use store::Store;
