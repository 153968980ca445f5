pub mod support;

pub mod plugin_tests;
