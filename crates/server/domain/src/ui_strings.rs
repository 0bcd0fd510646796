//! Russian user-facing strings for chat messages and TTS prompts.

/// Inline-button label a guardian presses to take responsibility.
pub const ACK_BUTTON_LABEL: &str = "✅ Ясно";

/// Inline-button label a traveler presses to stand down.
pub const CANCEL_BUTTON_LABEL: &str = "❌ Опасность миновала";

pub fn panic_alert(traveler_name: &str) -> String {
    format!(
        "🚨 {} нажал(а) кнопку Опасность! Нажмите «Ясно», чтобы остановить напоминания.",
        traveler_name
    )
}

pub fn reminder_alert(traveler_name: &str, round: u32) -> String {
    format!(
        "⏰ Тревога всё ещё активна! {} ждёт ответа. Кто возьмёт ответственность? (напоминание {})",
        traveler_name, round
    )
}

pub fn handled_alert(guardian_name: &str) -> String {
    format!(
        "✅ {} взял(а) ответственность. Рассылка остановлена.",
        guardian_name
    )
}

pub fn canceled_alert(traveler_name: &str) -> String {
    format!("❌ {} отменил(а) тревогу.", traveler_name)
}

pub fn traveler_opened(traveler_name: &str) -> String {
    format!(
        "🚨 {}, тревога отправлена вашим близким. Мы сообщим, когда кто-то откликнется.",
        traveler_name
    )
}

pub fn traveler_acknowledged(guardian_name: &str) -> String {
    format!("✅ {} взял(а) ответственность и свяжется с вами.", guardian_name)
}

pub fn traveler_canceled() -> String {
    "❌ Тревога отменена. Берегите себя.".to_string()
}

pub fn traveler_unreachable() -> String {
    "⚠️ Не удалось дозвониться ни до одного из ваших близких. Тревога остаётся активной."
        .to_string()
}

pub fn start_greeting() -> String {
    "👋 Привет! Бот подключен.".to_string()
}

pub fn tts_panic_prompt(traveler_name: &str) -> String {
    format!(
        "Тревога! Срочно свяжитесь с {}. Нажмите 1, чтобы подтвердить.",
        traveler_name
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompts_embed_the_name() {
        assert!(tts_panic_prompt("Мария").contains("Мария"));
        assert!(panic_alert("Мария").contains("Мария"));
        assert!(handled_alert("Иван").contains("Иван"));
    }
}
