mod common;

mod auth;
mod extraction;
mod files;
