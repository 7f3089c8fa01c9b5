#![allow(dead_code)] // each integration test uses a different helper subset

pub mod synthetic;
