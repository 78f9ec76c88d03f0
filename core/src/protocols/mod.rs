//! Protocol header views used by the decode stage.

pub mod packet;
