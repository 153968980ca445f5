pub mod bus_tests;
