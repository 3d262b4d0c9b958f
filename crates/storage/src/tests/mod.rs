mod helpers;
mod section_tests;
