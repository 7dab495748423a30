#![forbid(unsafe_code)]

//! Command-line utilities: opening a database, demo data and CSV
//! import/export of biosamples.

/// Opening databases and seeding demo content.
pub mod admin;

/// Biosample import from and export to CSV files.
///
/// An import is one batch: every row is validated together and either all
/// rows are saved or none is.
pub mod import_export;
