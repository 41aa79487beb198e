pub mod army;
pub mod delete_all;
pub mod demo;
pub mod simulate;
