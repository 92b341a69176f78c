//! SCSI command layer
//!
//! Pure encoding and decoding of the pieces of the SCSI protocol the copy
//! engine speaks: READ/WRITE command blocks, sense data classification and
//! the Linux sg driver's kernel ABI.

pub mod cdb;
pub mod sense;
pub mod sg;

pub use cdb::{Cdb, CdbError, Direction};
pub use sense::{Disposition, SenseCategory};
