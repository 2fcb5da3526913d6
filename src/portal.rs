//! ポータル画面の判定（ログイン画面・ようこそ画面・SMS認証）とフォーム再現
//!
//! HTTP方式・ブラウザ方式のどちらも、最終的なURLとHTMLをここで判定する。

use reqwest::Url;
use scraper::{Html, Selector};

use crate::challenge::ChallengePrompt;
use crate::config::PortalConfig;

pub const LOGIN_INPUT: &str = "input[name='IDToken1']";
pub const PASSWORD_INPUT: &str = "input[name='IDToken2']";
pub const SUBMIT_BUTTON: &str = "button[name='Login.Submit']";
pub const BALANCE_WIDGET: &str = "#accountBallances";
pub const BALANCE_BUTTON: &str = "#accountBallances a";
pub const MODAL_CLOSE: &str = "#fancybox-close";
pub const LOADER: &str = ".loader-content";
pub const LOGOUT_BUTTON: &str = "#ssoLogout";
/// ログイン画面のタイトルに含まれる文字列
pub const LOGIN_TITLE: &str = "Logowanie";

const DEFAULT_CHALLENGE_MESSAGE: &str = "Play24 wysłał kod SMS. Wpisz kod, aby dokończyć logowanie.";

/// ログイン送信後の画面の分類
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    /// ようこそ画面（ログイン成功）
    Welcome,
    /// SMS認証コードの入力画面
    Challenge(ChallengePrompt),
    /// ログインフォームが再表示された（認証情報の誤り）
    LoginForm,
    /// どれにも一致しない（ポータルの仕様変更）
    Unknown,
}

/// 送信するフォームの内容
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormSubmission {
    pub action: String,
    pub fields: Vec<(String, String)>,
}

impl FormSubmission {
    /// 同名の項目があれば置き換え、無ければ追加
    pub fn set(&mut self, name: &str, value: &str) {
        match self.fields.iter_mut().find(|(n, _)| n == name) {
            Some(field) => field.1 = value.to_string(),
            None => self.fields.push((name.to_string(), value.to_string())),
        }
    }
}

fn selector(s: &str) -> Option<Selector> {
    Selector::parse(s).ok()
}

fn has_element(doc: &Html, s: &str) -> bool {
    selector(s).is_some_and(|sel| doc.select(&sel).next().is_some())
}

fn title(doc: &Html) -> String {
    selector("title")
        .and_then(|sel| doc.select(&sel).next().map(|el| el.text().collect::<String>()))
        .unwrap_or_default()
}

fn path_matches(url: &str, path: &str) -> bool {
    Url::parse(url)
        .map(|u| u.path().trim_end_matches('/') == path.trim_end_matches('/'))
        .unwrap_or(false)
}

/// ようこそ画面か（URLがようこそ画面で、残高ボタンがある）
pub fn is_welcome(portal: &PortalConfig, url: &str, html: &str) -> bool {
    path_matches(url, &portal.welcome_path) && has_element(&Html::parse_document(html), BALANCE_WIDGET)
}

/// ログイン画面に戻されているか
pub fn is_login_page(html: &str) -> bool {
    let doc = Html::parse_document(html);
    title(&doc).contains(LOGIN_TITLE) || has_element(&doc, PASSWORD_INPUT)
}

/// SMS認証画面ならその表示内容
pub fn challenge_prompt(portal: &PortalConfig, html: &str) -> Option<ChallengePrompt> {
    let doc = Html::parse_document(html);
    if !has_element(&doc, &portal.challenge_selector) {
        return None;
    }

    let message = selector("form p, p")
        .and_then(|sel| {
            doc.select(&sel)
                .map(|el| el.text().collect::<String>().trim().to_string())
                .find(|text| !text.is_empty())
        })
        .unwrap_or_else(|| DEFAULT_CHALLENGE_MESSAGE.to_string());
    Some(ChallengePrompt { message })
}

/// ログイン送信後の画面を分類する
pub fn classify(portal: &PortalConfig, url: &str, html: &str) -> LoginOutcome {
    if is_welcome(portal, url, html) {
        return LoginOutcome::Welcome;
    }
    if let Some(prompt) = challenge_prompt(portal, html) {
        return LoginOutcome::Challenge(prompt);
    }
    if is_login_page(html) {
        return LoginOutcome::LoginForm;
    }
    LoginOutcome::Unknown
}

/// `marker` に一致する要素を含むフォームを探し、hidden項目と送信ボタンを集める
pub fn find_form(html: &str, page_url: &str, marker: &str) -> Option<FormSubmission> {
    let doc = Html::parse_document(html);
    let form_sel = selector("form")?;
    let marker_sel = selector(marker)?;
    let hidden_sel = selector("input[type='hidden'][name]")?;
    let submit_sel = selector("button[name], input[type='submit'][name]")?;

    let form = doc
        .select(&form_sel)
        .find(|form| form.select(&marker_sel).next().is_some())?;

    let base = Url::parse(page_url).ok()?;
    let action = match form.value().attr("action") {
        Some(action) if !action.is_empty() => base.join(action).ok()?,
        _ => base,
    };

    let mut fields: Vec<(String, String)> = form
        .select(&hidden_sel)
        .filter_map(|input| {
            let el = input.value();
            Some((el.attr("name")?.to_string(), el.attr("value").unwrap_or("").to_string()))
        })
        .collect();

    if let Some(submit) = form.select(&submit_sel).next() {
        let el = submit.value();
        if let Some(name) = el.attr("name") {
            fields.push((name.to_string(), el.attr("value").unwrap_or("").to_string()));
        }
    }

    Some(FormSubmission {
        action: action.to_string(),
        fields,
    })
}

/// `selector` に最初に一致した要素の name 属性
pub fn input_name(html: &str, selector_str: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    let sel = selector(selector_str)?;
    doc.select(&sel)
        .next()
        .and_then(|el| el.value().attr("name").map(str::to_string))
}

/// コンテナ要素の innerHTML
pub fn container_html(html: &str, selector_str: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    let sel = selector(selector_str)?;
    doc.select(&sel).next().map(|el| el.inner_html())
}
