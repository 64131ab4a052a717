mod key_tests;
mod memtable_tests;
