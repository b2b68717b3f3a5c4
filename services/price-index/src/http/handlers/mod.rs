pub mod health;
pub mod index;
pub mod ingest;
pub mod ws;
