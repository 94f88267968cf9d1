// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
pub mod in_progress_tests;
pub mod support;
