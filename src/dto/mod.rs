mod reading_select_result;

pub use reading_select_result::ReadingSelectResult;
