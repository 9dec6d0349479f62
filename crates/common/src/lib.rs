// bittle-common: wire types and utilities shared by the bittle server and its clients

pub mod path;
pub mod protocol;
