pub const OCR_INSTRUCTION: &str =
    "You are an OCR expert in bank. Extract the information from this bank cheque.";

pub const END_OF_TURN: &str = "<|im_end|>";

const IMAGE_PLACEHOLDER: &str = "<|vision_start|><|image_pad|><|vision_end|>";

/// Renders a single user turn holding one image and the instruction, followed
/// by the assistant header so generation starts with the answer.
pub fn render_chat_prompt(instruction: &str) -> String {
    format!(
        "<|im_start|>user\n{IMAGE_PLACEHOLDER}{instruction}{END_OF_TURN}\n<|im_start|>assistant\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_places_image_before_instruction() {
        let prompt = render_chat_prompt(OCR_INSTRUCTION);
        let image_at = prompt.find("<|image_pad|>").unwrap();
        let text_at = prompt.find(OCR_INSTRUCTION).unwrap();
        assert!(image_at < text_at);
        assert!(prompt.starts_with("<|im_start|>user\n"));
        assert!(prompt.ends_with("<|im_start|>assistant\n"));
    }

    #[test]
    fn user_turn_is_closed_once() {
        let prompt = render_chat_prompt("read this");
        assert_eq!(prompt.matches(END_OF_TURN).count(), 1);
    }
}
