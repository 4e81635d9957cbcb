//! 가격 계산을 위한 Decimal 유틸리티.

use rust_decimal::Decimal;

/// 금융 정밀도를 위한 가격 타입.
pub type Price = Decimal;

/// 가격 목록의 산술 평균을 계산합니다.
///
/// 빈 목록이면 `None`을 반환합니다.
pub fn mean_price(prices: &[Price]) -> Option<Price> {
    if prices.is_empty() {
        return None;
    }

    let sum: Decimal = prices.iter().copied().sum();
    Some(sum / Decimal::from(prices.len()))
}

/// 표시용으로 가격을 소수점 `dp` 자리로 반올림합니다.
pub fn round_price(price: Price, dp: u32) -> Price {
    price.round_dp_with_strategy(dp, rust_decimal::RoundingStrategy::MidpointAwayFromZero)
}
