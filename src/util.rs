pub mod auth;
pub mod object;
pub mod poll;
pub mod pool;
pub mod protected;
pub mod region;
