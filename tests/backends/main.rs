mod helpers;
mod postgres;
mod redis;
