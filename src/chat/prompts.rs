use chrono::{Datelike, Local, NaiveDate};

const WEEKDAYS: [&str; 7] = ["周一", "周二", "周三", "周四", "周五", "周六", "周日"];

const INSTRUCTIONS: &str = "- 你可以使用可用的工具来帮助用户解决问题。\n\
- 当用户的问题需要获取实时信息、执行特定操作或使用外部服务时，请使用合适的工具。\n\
- 对于一般性问题、知识性问题或不需要工具的问题，请直接回答。\n\
- 如果决定使用工具，请只输出 tool_calls，不要同时输出自然语言回答。\n\
- 如果决定不使用工具，请提供有帮助的中文回答。\n";

/// System prompt for today's local date
pub fn system_prompt() -> String {
    system_prompt_for(Local::now().date_naive())
}

pub fn system_prompt_for(date: NaiveDate) -> String {
    let weekday = WEEKDAYS[date.weekday().num_days_from_monday() as usize];
    format!(
        "今天是 {}（{}）。你是一个有用、无害、诚实的AI助手。\n{}",
        date.format("%Y年%m月%d日"),
        weekday,
        INSTRUCTIONS
    )
}
