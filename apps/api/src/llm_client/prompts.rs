// Prompt templates for the request-shaping helpers on `LlmClient`.
// Placeholders in braces are filled with `str::replace` at call time.

/// Free-form application question. Fills: job_title, company, max_length,
/// applicant_context, question.
pub const ANSWER_PROMPT_TEMPLATE: &str = "\
You are helping someone apply for a {job_title} position at {company}.

GUIDELINES:
1. Answer in the applicant's voice, grounded in the background below. \
Where the background shows closely related experience, lead with it.
2. For questions about work arrangements (hybrid, on-site, relocation, \
commuting), answer positively and briefly.
3. For descriptive questions, give a 2-3 sentence summary drawing on \
concrete achievements or projects. Do not include personal contact details.
4. For start-date questions, give a specific date or \"Immediately\".
5. Be professional and concise: under {max_length} characters.

Applicant Background:
{applicant_context}

Question: {question}

Answer (be concise and professional):";

/// Pick-one-of-N form field. Fills: field_label, applicant_context, options.
pub const SELECT_OPTION_PROMPT_TEMPLATE: &str = "\
Select the best option from the list below for the applicant, based on their profile.
If none are suitable, return \"None\".

Field: {field_label}
Applicant Profile Summary:
{applicant_context}

GUIDELINES:
1. If the profile explicitly matches an option, select it.
2. For work logistics (relocation, commuting, hybrid, in-person), prefer the \
willing/affirmative option.
3. For work authorization and sponsorship, follow the profile exactly.
4. If unsure, select the most flexible option.

Options:
{options}

Return ONLY the exact text of the chosen option. Do not explain.";
